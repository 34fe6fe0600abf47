//! MapCSS stylesheet parsing.
//!
//! A hand-written recursive-descent parser with line/column tracking.
//! Attribute names resolve through a data-driven table mapping each name
//! to a setter on `StyleTemplate`; unknown attributes warn and are
//! skipped, so one typo never rejects a whole stylesheet. Parse errors
//! carry file, position, line content and the expected token.
//!
//! `load_stylesheet` wraps parsing in a wall-clock timeout: a parse that
//! overruns reports failure without touching any previously loaded
//! stylesheet.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::error::{ParseDiagnostics, TileError, TileResult};
use crate::eval::{Eval, EvalInfo};
use crate::rule::{compile_tag_regex, AcceptKind, CompareOp, Rule, Selector, Zoom};
use crate::strings::StringTable;
use crate::stylesheet::Stylesheet;
use crate::style::StyleTemplate;

/// Object spelling in a subselector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    Node,
    Way,
    Relation,
    Area,
    Line,
    Any,
}

#[derive(Debug)]
enum Condition {
    HasTag(String),
    HasNotTag(String),
    Binary(String, BinOp, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Equal,
    Unequal,
    Matches,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
}

#[derive(Debug)]
struct SelectorItem {
    object: ObjectKind,
    zoom: Zoom,
    conditions: Vec<Condition>,
}

type AttrSetter = fn(&mut StyleTemplate, &str, EvalInfo) -> Result<(), String>;

macro_rules! attr_setter {
    ($field:ident) => {
        |template, value, info| {
            template.$field = Some(Eval::parse(value, info)?);
            Ok(())
        }
    };
}

/// Attribute table: each MapCSS attribute name maps to its template
/// setter. Lookups are linear; the table is tiny and parsing is cold.
static ATTRIBUTES: &[(&str, AttrSetter)] = &[
    ("casing-color", attr_setter!(casing_color)),
    ("casing-dashes", attr_setter!(casing_dashes)),
    ("casing-linecap", attr_setter!(casing_linecap)),
    ("casing-linejoin", attr_setter!(casing_linejoin)),
    ("casing-width", attr_setter!(casing_width)),
    ("color", attr_setter!(color)),
    ("dashes", attr_setter!(dashes)),
    ("fill-color", attr_setter!(fill_color)),
    ("fill-image", attr_setter!(fill_image)),
    ("font-family", attr_setter!(font_family)),
    ("font-size", attr_setter!(font_size)),
    ("font-style", attr_setter!(font_style)),
    ("font-weight", attr_setter!(font_weight)),
    ("icon-height", attr_setter!(icon_height)),
    ("icon-image", attr_setter!(icon_image)),
    ("icon-opacity", attr_setter!(icon_opacity)),
    ("icon-width", attr_setter!(icon_width)),
    ("linecap", attr_setter!(linecap)),
    ("linejoin", attr_setter!(linejoin)),
    ("shield-casing-color", attr_setter!(shield_casing_color)),
    ("shield-casing-width", attr_setter!(shield_casing_width)),
    ("shield-color", attr_setter!(shield_color)),
    ("shield-frame-color", attr_setter!(shield_frame_color)),
    ("shield-frame-width", attr_setter!(shield_frame_width)),
    ("shield-image", attr_setter!(shield_image)),
    ("shield-opacity", attr_setter!(shield_opacity)),
    ("shield-shape", attr_setter!(shield_shape)),
    ("shield-text", attr_setter!(shield_text)),
    ("text", attr_setter!(text)),
    ("text-color", attr_setter!(text_color)),
    ("text-halo-color", attr_setter!(text_halo_color)),
    ("text-halo-radius", attr_setter!(text_halo_radius)),
    ("text-offset", attr_setter!(text_offset)),
    ("text-position", attr_setter!(text_position)),
    ("width", attr_setter!(width)),
    ("z-index", attr_setter!(z_index)),
];

fn lookup_attribute(name: &str) -> Option<AttrSetter> {
    ATTRIBUTES
        .iter()
        .find(|(attr, _)| *attr == name)
        .map(|(_, setter)| *setter)
}

struct Parser<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
    file: String,
    strings: &'a StringTable,
}

fn is_tag_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b':' | b'-')
}

fn is_value_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'/' | b'-')
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-')
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, file: &str, strings: &'a StringTable) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
            file: file.to_string(),
            strings,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(b)
    }

    /// Skip whitespace plus `//` and `/* */` comments.
    fn skip_trivia(&mut self) {
        loop {
            while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
                self.bump();
            }
            if self.bytes[self.pos..].starts_with(b"//") {
                while self.peek().is_some_and(|b| b != b'\n') {
                    self.bump();
                }
                continue;
            }
            if self.bytes[self.pos..].starts_with(b"/*") {
                self.bump();
                self.bump();
                while self.pos < self.bytes.len() && !self.bytes[self.pos..].starts_with(b"*/") {
                    self.bump();
                }
                self.bump();
                self.bump();
                continue;
            }
            return;
        }
    }

    fn line_content(&self, line: u32) -> String {
        self.source
            .lines()
            .nth(line.saturating_sub(1) as usize)
            .unwrap_or("")
            .replace('\t', " ")
    }

    fn fail(&self, expected: &str) -> TileError {
        TileError::Parse(ParseDiagnostics {
            file: self.file.clone(),
            line: self.line,
            column: self.column,
            line_content: self.line_content(self.line),
            expected: expected.to_string(),
        })
    }

    fn expect(&mut self, b: u8, expected: &str) -> TileResult<()> {
        if self.peek() == Some(b) {
            self.bump();
            Ok(())
        } else {
            Err(self.fail(expected))
        }
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(&pred) {
            self.bump();
        }
        &self.source[start..self.pos]
    }

    fn eval_info(&self) -> EvalInfo {
        EvalInfo {
            line: self.line,
            content: self.line_content(self.line),
        }
    }

    // ---- grammar ------------------------------------------------------

    fn parse_document(&mut self) -> TileResult<(Vec<Rule>, StyleTemplate)> {
        let mut rules = Vec::new();
        let mut canvas = StyleTemplate::default();
        loop {
            self.skip_trivia();
            if self.peek().is_none() {
                return Ok((rules, canvas));
            }
            if self.at_keyword("canvas") {
                self.pos += "canvas".len();
                self.column += "canvas".len() as u32;
                self.skip_trivia();
                self.expect(b'{', "'{' after canvas")?;
                canvas = StyleTemplate::default();
                self.parse_declarations(&mut canvas)?;
            } else {
                rules.extend(self.parse_css_rule()?);
            }
        }
    }

    fn at_keyword(&self, word: &str) -> bool {
        self.bytes[self.pos..].starts_with(word.as_bytes())
            && !self
                .bytes
                .get(self.pos + word.len())
                .copied()
                .is_some_and(is_tag_byte)
    }

    /// One `selectors { declarations }` block; comma-separated selector
    /// groups share a single parsed template.
    fn parse_css_rule(&mut self) -> TileResult<Vec<Rule>> {
        let mut chains = vec![self.parse_selector_chain()?];
        loop {
            self.skip_trivia();
            if self.eat(b',') {
                chains.push(self.parse_selector_chain()?);
            } else {
                break;
            }
        }
        self.expect(b'{', "'{'")?;
        let mut template = StyleTemplate::default();
        self.parse_declarations(&mut template)?;

        let template = Arc::new(template);
        Ok(chains
            .into_iter()
            .map(|items| self.build_rule(items, Arc::clone(&template)))
            .collect())
    }

    fn parse_selector_chain(&mut self) -> TileResult<Vec<SelectorItem>> {
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                Some(b'*') => {
                    self.bump();
                    items.push(self.parse_item_tail(ObjectKind::Any)?);
                }
                Some(b) if b.is_ascii_alphabetic() => {
                    let word = self.take_while(|b| b.is_ascii_alphanumeric());
                    let object = match word {
                        "node" => ObjectKind::Node,
                        "way" => ObjectKind::Way,
                        "relation" => ObjectKind::Relation,
                        "area" => ObjectKind::Area,
                        "line" => ObjectKind::Line,
                        _ => return Err(self.fail("an object selector")),
                    };
                    items.push(self.parse_item_tail(object)?);
                }
                _ => {
                    if items.is_empty() {
                        return Err(self.fail("an object selector"));
                    }
                    return Ok(items);
                }
            }
        }
    }

    fn parse_item_tail(&mut self, object: ObjectKind) -> TileResult<SelectorItem> {
        self.skip_trivia();
        let zoom = if self.bytes[self.pos..].starts_with(b"|z") {
            self.bump();
            self.bump();
            self.parse_zoom()?
        } else {
            Zoom::default()
        };

        let mut conditions = Vec::new();
        loop {
            self.skip_trivia();
            if !self.eat(b'[') {
                break;
            }
            conditions.push(self.parse_condition()?);
            self.expect(b']', "']'")?;
        }

        Ok(SelectorItem {
            object,
            zoom,
            conditions,
        })
    }

    fn parse_zoom_bound(&mut self) -> Option<u32> {
        let digits = self.take_while(|b| b.is_ascii_digit());
        digits.parse().ok()
    }

    /// `|z12`, `|z12-`, `|z-12`, `|z4-12`.
    fn parse_zoom(&mut self) -> TileResult<Zoom> {
        let low = self.parse_zoom_bound();
        if self.eat(b'-') {
            let high = self.parse_zoom_bound();
            Ok(Zoom::new(
                low.unwrap_or(0).min(255) as u8,
                high.unwrap_or(crate::geom::MAX_ZOOM as u32).min(255) as u8,
            ))
        } else {
            match low {
                Some(z) => Ok(Zoom::new(z.min(255) as u8, z.min(255) as u8)),
                None => Err(self.fail("a zoom level")),
            }
        }
    }

    fn parse_condition(&mut self) -> TileResult<Condition> {
        if self.eat(b'!') {
            let tag = self.take_while(is_tag_byte);
            if tag.is_empty() {
                return Err(self.fail("a tag name"));
            }
            return Ok(Condition::HasNotTag(tag.to_string()));
        }

        let tag = self.take_while(is_tag_byte);
        if tag.is_empty() {
            return Err(self.fail("a tag name"));
        }

        let op = if self.bytes[self.pos..].starts_with(b"!=") {
            self.bump();
            self.bump();
            BinOp::Unequal
        } else if self.bytes[self.pos..].starts_with(b"=~") {
            self.bump();
            self.bump();
            BinOp::Matches
        } else if self.bytes[self.pos..].starts_with(b"<=") {
            self.bump();
            self.bump();
            BinOp::LessEqual
        } else if self.bytes[self.pos..].starts_with(b">=") {
            self.bump();
            self.bump();
            BinOp::GreaterEqual
        } else if self.eat(b'=') {
            BinOp::Equal
        } else if self.eat(b'<') {
            BinOp::Less
        } else if self.eat(b'>') {
            BinOp::Greater
        } else {
            return Ok(Condition::HasTag(tag.to_string()));
        };

        let value = self.parse_condition_value()?;
        Ok(Condition::Binary(tag.to_string(), op, value))
    }

    fn parse_condition_value(&mut self) -> TileResult<String> {
        match self.peek() {
            Some(quote @ (b'"' | b'\'')) => {
                self.bump();
                let start = self.pos;
                while self.peek().is_some_and(|b| b != quote) {
                    self.bump();
                }
                let value = self.source[start..self.pos].to_string();
                self.expect(quote, "a closing quote")?;
                Ok(value)
            }
            _ => {
                let value = self.take_while(is_value_byte);
                if value.is_empty() {
                    return Err(self.fail("a tag value"));
                }
                Ok(value.to_string())
            }
        }
    }

    fn parse_declarations(&mut self, template: &mut StyleTemplate) -> TileResult<()> {
        loop {
            self.skip_trivia();
            if self.eat(b'}') {
                return Ok(());
            }
            if self.peek().is_none() {
                return Err(self.fail("'}'"));
            }

            let name_line = self.line;
            let name = self.take_while(is_name_byte);
            if name.is_empty() {
                return Err(self.fail("an attribute name"));
            }
            self.skip_trivia();
            self.expect(b':', "':'")?;
            self.skip_trivia();

            let info = self.eval_info();
            let value = self.parse_specifier()?;

            match lookup_attribute(name) {
                Some(setter) => {
                    if let Err(reason) = setter(template, &value, info) {
                        warn!(
                            "{}:{}: attribute '{}' ignored: {}",
                            self.file, name_line, name, reason
                        );
                    }
                }
                None => {
                    warn!(
                        "{}:{}: unsupported attribute '{}' was ignored",
                        self.file, name_line, name
                    );
                }
            }

            self.skip_trivia();
            // ';' separates declarations; the last one may omit it
            if !self.eat(b';') && self.peek() != Some(b'}') {
                return Err(self.fail("';'"));
            }
        }
    }

    fn parse_specifier(&mut self) -> TileResult<String> {
        if let Some(quote @ (b'"' | b'\'')) = self.peek() {
            self.bump();
            let start = self.pos;
            while self.peek().is_some_and(|b| b != quote) {
                self.bump();
            }
            let value = self.source[start..self.pos].to_string();
            self.expect(quote, "a closing quote")?;
            return Ok(value);
        }
        let start = self.pos;
        while self.peek().is_some_and(|b| b != b';' && b != b'}') {
            self.bump();
        }
        Ok(self.source[start..self.pos].trim().to_string())
    }

    // ---- rule construction --------------------------------------------

    fn condition_selector(&self, condition: Condition) -> Option<Selector> {
        Some(match condition {
            Condition::HasTag(tag) => Selector::HasTag(self.strings.intern(&tag)),
            Condition::HasNotTag(tag) => Selector::HasNotTag(self.strings.intern(&tag)),
            Condition::Binary(tag, op, value) => {
                let key = self.strings.intern(&tag);
                match op {
                    BinOp::Equal => Selector::TagEquals(key, self.strings.intern(&value)),
                    BinOp::Unequal => Selector::TagUnequals(key, self.strings.intern(&value)),
                    BinOp::Matches => Selector::TagMatches(key, compile_tag_regex(&value)?),
                    BinOp::Less | BinOp::Greater | BinOp::LessEqual | BinOp::GreaterEqual => {
                        let number: f64 = match value.parse() {
                            Ok(n) => n,
                            Err(_) => {
                                warn!(
                                    "{}: cannot compare tag '{}' against non-numeric '{}'",
                                    self.file, tag, value
                                );
                                return None;
                            }
                        };
                        let op = match op {
                            BinOp::Less => CompareOp::Less,
                            BinOp::Greater => CompareOp::Greater,
                            BinOp::LessEqual => CompareOp::LessEqual,
                            _ => CompareOp::GreaterEqual,
                        };
                        Selector::TagOrd(key, op, number)
                    }
                }
            }
        })
    }

    /// Linearize a subselector list into a flat predicate chain.
    ///
    /// The first item decides the accept kind (with `area`/`line`
    /// contributing a geometry predicate); every further item recurses
    /// into relation members. Item zooms intersect.
    fn build_rule(&self, items: Vec<SelectorItem>, template: Arc<StyleTemplate>) -> Rule {
        let mut selectors = Vec::new();
        let mut zoom = Zoom::default();
        let mut accept = AcceptKind::Any;

        for (index, item) in items.into_iter().enumerate() {
            zoom = zoom.focus(&item.zoom);
            if index == 0 {
                match item.object {
                    ObjectKind::Any => accept = AcceptKind::Any,
                    ObjectKind::Node => accept = AcceptKind::Node,
                    ObjectKind::Way => accept = AcceptKind::Way,
                    ObjectKind::Relation => accept = AcceptKind::Relation,
                    ObjectKind::Line => {
                        accept = AcceptKind::Way;
                        selectors.push(Selector::Line);
                    }
                    ObjectKind::Area => {
                        accept = AcceptKind::Way;
                        selectors.push(Selector::Area);
                    }
                }
            } else {
                match item.object {
                    ObjectKind::Any => {}
                    ObjectKind::Node => selectors.push(Selector::ChildNodes),
                    ObjectKind::Way => selectors.push(Selector::ChildWays),
                    ObjectKind::Relation => {
                        warn!("{}: nested relation selectors are not supported", self.file)
                    }
                    ObjectKind::Line => {
                        selectors.push(Selector::ChildWays);
                        selectors.push(Selector::Line);
                    }
                    ObjectKind::Area => {
                        selectors.push(Selector::ChildWays);
                        selectors.push(Selector::Area);
                    }
                }
            }
            for condition in item.conditions {
                if let Some(selector) = self.condition_selector(condition) {
                    selectors.push(selector);
                }
            }
        }

        selectors.push(Selector::Apply);
        Rule {
            selectors,
            zoom,
            accept,
            template,
        }
    }
}

/// Parse stylesheet source text into a compiled stylesheet.
pub fn parse_stylesheet(
    source: &str,
    file: &str,
    strings: &StringTable,
    path: PathBuf,
) -> TileResult<Stylesheet> {
    let mut parser = Parser::new(source, file, strings);
    let (rules, canvas) = parser.parse_document()?;
    Ok(Stylesheet::new(rules, canvas, path))
}

/// Read and parse a stylesheet file under a wall-clock timeout.
///
/// The parse runs on its own thread; on timeout the thread is abandoned
/// (parsing is a pure function over an owned buffer, its late result is
/// dropped) and `ParseTimeout` is reported.
pub fn load_stylesheet(
    path: &Path,
    strings: &Arc<StringTable>,
    timeout_ms: u64,
) -> TileResult<Stylesheet> {
    let source = std::fs::read_to_string(path)?;
    let file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let (tx, rx) = crossbeam_channel::bounded(1);
    let strings = Arc::clone(strings);
    let path_buf = path.to_path_buf();
    std::thread::Builder::new()
        .name("mapcss-parse".into())
        .spawn(move || {
            let result = parse_stylesheet(&source, &file, &strings, path_buf);
            let _ = tx.send(result);
        })?;

    match rx.recv_timeout(Duration::from_millis(timeout_ms)) {
        Ok(result) => result,
        Err(_) => Err(TileError::ParseTimeout {
            path: path.to_path_buf(),
            timeout_ms,
        }),
    }
}
