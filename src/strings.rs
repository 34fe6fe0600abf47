//! Interned strings for tag keys and small tag values.
//!
//! Identical strings share one allocation and compare by pointer first,
//! falling back to text comparison only across tables. Hashes are computed
//! once at intern time, which makes tag maps keyed by `CachedString` cheap
//! to probe on the matching hot path.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;

const SHARD_COUNT: usize = 16;

#[derive(Debug)]
struct Interned {
    hash: u64,
    text: Box<str>,
}

/// An interned, immutable string with a precomputed hash.
///
/// Two `CachedString`s produced from equal `&str` by the same table hold
/// the same allocation, so equality is usually a pointer comparison.
#[derive(Clone)]
pub struct CachedString {
    inner: Arc<Interned>,
}

impl CachedString {
    pub fn as_str(&self) -> &str {
        &self.inner.text
    }

    /// The hash computed at intern time. Stable for the process lifetime.
    pub fn precomputed_hash(&self) -> u64 {
        self.inner.hash
    }
}

impl PartialEq for CachedString {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.hash == other.inner.hash && self.inner.text == other.inner.text)
    }
}

impl Eq for CachedString {}

impl Hash for CachedString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.inner.hash);
    }
}

impl PartialOrd for CachedString {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CachedString {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl fmt::Debug for CachedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for CachedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Process-scoped intern table with sharded locks.
///
/// Interning is a hot path during geodata load and stylesheet parsing, so
/// the table is split into shards selected by hash to keep contention low.
pub struct StringTable {
    shards: Vec<Mutex<HashMap<u64, Vec<Arc<Interned>>>>>,
}

impl StringTable {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, hash: u64) -> &Mutex<HashMap<u64, Vec<Arc<Interned>>>> {
        &self.shards[(hash as usize) % SHARD_COUNT]
    }

    /// Intern `s`, returning the shared handle. Inserts on first sight.
    pub fn intern(&self, s: &str) -> CachedString {
        let hash = fnv1a(s);
        let mut shard = self.shard(hash).lock();
        let bucket = shard.entry(hash).or_default();
        if let Some(existing) = bucket.iter().find(|i| &*i.text == s) {
            return CachedString {
                inner: Arc::clone(existing),
            };
        }
        let interned = Arc::new(Interned {
            hash,
            text: s.into(),
        });
        bucket.push(Arc::clone(&interned));
        CachedString { inner: interned }
    }

    /// Look up `s` without inserting.
    ///
    /// Used by runtime tag lookups: a key that was never interned cannot
    /// appear in any tag map, so a `None` here short-circuits to "absent".
    pub fn lookup(&self, s: &str) -> Option<CachedString> {
        let hash = fnv1a(s);
        let shard = self.shard(hash).lock();
        let bucket = shard.get(&hash)?;
        bucket.iter().find(|i| &*i.text == s).map(|i| CachedString {
            inner: Arc::clone(i),
        })
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Tag mapping of a geo-object, keyed by interned strings.
#[derive(Debug, Clone, Default)]
pub struct Tags {
    map: HashMap<CachedString, CachedString>,
}

impl Tags {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: CachedString, value: CachedString) {
        self.map.insert(key, value);
    }

    pub fn get(&self, key: &CachedString) -> Option<&CachedString> {
        self.map.get(key)
    }

    /// Look up a key that only exists as a plain string at runtime.
    pub fn get_str(&self, key: &str, table: &StringTable) -> Option<&CachedString> {
        let cached = table.lookup(key)?;
        self.map.get(&cached)
    }

    pub fn contains(&self, key: &CachedString) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CachedString, &CachedString)> {
        self.map.iter()
    }

    /// Build from plain string pairs, interning through `table`.
    pub fn from_pairs<'a, I>(pairs: I, table: &StringTable) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut tags = Self::new();
        for (k, v) in pairs {
            tags.insert(table.intern(k), table.intern(v));
        }
        tags
    }
}
