//! Request admission and the worker pool.
//!
//! Two FIFO queues feed the workers: a bounded one for user requests
//! (overflow answers 503 at submit time, the submitter never blocks) and
//! an unbounded one for prerendering, drained only when no user work is
//! waiting. An in-flight index keyed by meta-identifier coalesces
//! concurrent requests for tiles of the same meta into one render.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use log::{error, info};
use parking_lot::{Condvar, Mutex};

use crate::config::ServerConfig;
use crate::job::{Job, JobContext};
use crate::tile::{MetaIdentifier, TileFormat, TileIdentifier};

/// Outcome class of a tile request, mapped to an HTTP status by the
/// front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// 200: the tile rendered (or was cached).
    Ok,
    /// 500: rendering failed; the image is the default tile if one is
    /// available.
    InternalError,
    /// 503: the user queue was full at submission.
    Overloaded,
}

/// The single answer every submitted request eventually receives.
#[derive(Debug, Clone)]
pub struct TileResponse {
    pub status: ReplyStatus,
    pub image: Option<Bytes>,
    pub format: TileFormat,
}

impl TileResponse {
    pub fn ok(image: Option<Bytes>, format: TileFormat) -> Self {
        Self {
            status: ReplyStatus::Ok,
            image,
            format,
        }
    }

    pub fn internal_error(image: Option<Bytes>, format: TileFormat) -> Self {
        Self {
            status: ReplyStatus::InternalError,
            image,
            format,
        }
    }

    pub fn overloaded(format: TileFormat) -> Self {
        Self {
            status: ReplyStatus::Overloaded,
            image: None,
            format,
        }
    }
}

/// Owned reply handle. Each handle is answered exactly once; a sink
/// whose receiver is gone (client disconnect) swallows the answer.
pub trait TileSink: Send {
    fn deliver(self: Box<Self>, response: TileResponse);
}

impl TileSink for crossbeam_channel::Sender<TileResponse> {
    fn deliver(self: Box<Self>, response: TileResponse) {
        let _ = self.send(response);
    }
}

struct Queues {
    user: VecDeque<Arc<Job>>,
    prerender: VecDeque<Arc<Job>>,
}

struct Shared {
    ctx: JobContext,
    max_queue_size: usize,
    prerender_level: u8,
    queues: Mutex<Queues>,
    ready: Condvar,
    in_flight: Mutex<HashMap<MetaIdentifier, Arc<Job>>>,
    running: AtomicBool,
    jobs_processed: AtomicU64,
}

impl Shared {
    /// Queue a prerender job unless it is pointless: already in flight,
    /// or every member tile already rendered.
    fn submit_prerender(self: &Arc<Self>, mid: MetaIdentifier) {
        if self.ctx.cache.all_rendered(&mid) {
            return;
        }
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(&mid) {
                return;
            }
            let job = Arc::new(Job::new(mid.clone(), true));
            in_flight.insert(mid, Arc::clone(&job));
            self.queues.lock().prerender.push_back(job);
        }
        self.ready.notify_one();
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let job = {
                let mut queues = self.queues.lock();
                loop {
                    if !self.running.load(Ordering::Acquire) {
                        return;
                    }
                    if let Some(job) = queues
                        .user
                        .pop_front()
                        .or_else(|| queues.prerender.pop_front())
                    {
                        break job;
                    }
                    self.ready.wait(&mut queues);
                }
            };

            // deliver before dropping the job from the in-flight index:
            // a submitter racing this window still finds the job and its
            // late reply is answered from the settled result
            let result = job.process(&self.ctx);
            let mut at_prerender_ceiling = false;
            match result {
                Ok(outcome) => {
                    job.deliver(&outcome);
                    if job.is_prerender() {
                        if job.mid().zoom() < self.prerender_level {
                            for sub in job.mid().sub_metas() {
                                self.submit_prerender(sub);
                            }
                        } else {
                            at_prerender_ceiling = true;
                        }
                    }
                }
                Err(err) => {
                    error!("job {} failed: {err}", job.mid());
                    job.deliver_error(self.ctx.cache.default_tile());
                }
            }
            self.in_flight.lock().remove(job.mid());
            if at_prerender_ceiling && self.prerender_outstanding() == 0 {
                info!("prerendering finished");
            }
            self.jobs_processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn prerender_outstanding(&self) -> usize {
        let queued = self.queues.lock().prerender.len();
        let in_flight = self
            .in_flight
            .lock()
            .values()
            .filter(|job| job.is_prerender())
            .count();
        queued + in_flight
    }
}

/// Owns the queues, the in-flight index and the worker pool.
pub struct RequestManager {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RequestManager {
    pub fn new(ctx: JobContext, config: &ServerConfig) -> Arc<Self> {
        let shared = Arc::new(Shared {
            ctx,
            max_queue_size: config.max_queue_size,
            prerender_level: config.prerender_level,
            queues: Mutex::new(Queues {
                user: VecDeque::new(),
                prerender: VecDeque::new(),
            }),
            ready: Condvar::new(),
            in_flight: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            jobs_processed: AtomicU64::new(0),
        });

        let mut workers = Vec::new();
        for index in 0..config.worker_threads() {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("tile-worker-{index}"))
                .spawn(move || shared.worker_loop())
                .expect("failed to spawn tile worker");
            workers.push(handle);
        }

        Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Admit a user request for one tile.
    ///
    /// Joins the in-flight job for the covering meta if there is one;
    /// otherwise enqueues a new job, or answers 503 immediately when the
    /// user queue is at capacity. Never blocks the submitter.
    pub fn submit_user(&self, tid: TileIdentifier, sink: Box<dyn TileSink>) {
        let mid = MetaIdentifier::from_tile(&tid);
        let format = tid.format();
        {
            let mut in_flight = self.shared.in_flight.lock();
            if let Some(job) = in_flight.get(&mid) {
                job.attach(tid, sink);
                return;
            }

            let mut queues = self.shared.queues.lock();
            if queues.user.len() >= self.shared.max_queue_size {
                drop(queues);
                drop(in_flight);
                sink.deliver(TileResponse::overloaded(format));
                return;
            }

            let job = Arc::new(Job::new(mid.clone(), false));
            job.attach(tid, sink);
            in_flight.insert(mid, Arc::clone(&job));
            queues.user.push_back(job);
        }
        self.shared.ready.notify_one();
    }

    /// Queue a meta-tile for background prerendering.
    pub fn submit_prerender(&self, mid: MetaIdentifier) {
        self.shared.submit_prerender(mid);
    }

    /// Number of jobs fully processed since startup.
    pub fn jobs_processed(&self) -> u64 {
        self.shared.jobs_processed.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn user_queue_len(&self) -> usize {
        self.shared.queues.lock().user.len()
    }

    #[cfg(test)]
    pub(crate) fn in_flight_len(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    /// Stop accepting work and join the workers. Each worker finishes
    /// its current job first; queued jobs are dropped, which hangs up
    /// their reply handles.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.ready.notify_all();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for RequestManager {
    fn drop(&mut self) {
        self.stop();
    }
}
