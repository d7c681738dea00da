//! The cooperative event-loop Worker: a single-threaded executor draining a FIFO thunk queue
//! and registering low-level callbacks/wait-sources against its own `Loop` implementation.

use std::collections::{BinaryHeap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::error::{CoreError, CoreResult};
use crate::system::{DefaultHostAllocator, HostAllocator};

fn default_allocator() -> Arc<dyn HostAllocator> {
    Arc::new(DefaultHostAllocator)
}

/// Configuration accepted by [`Worker::new`].
#[derive(Clone, Serialize, Deserialize)]
pub struct WorkerOptions {
    pub name: String,
    /// `true` ⇒ the Worker spawns and owns a dedicated thread ([`Worker::start`]).
    /// `false` ⇒ a host thread must call [`Worker::run_on_current_thread`] exactly once.
    pub owned_thread: bool,
    #[serde(skip, default = "default_allocator")]
    pub allocator: Arc<dyn HostAllocator>,
    /// Max drain time per iteration when `owned_thread` is `true`.
    #[serde(with = "duration_ms")]
    pub quantum: Duration,
}

impl std::fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("name", &self.name)
            .field("owned_thread", &self.owned_thread)
            .field("quantum", &self.quantum)
            .finish()
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: "fiberflow-worker".to_string(),
            owned_thread: true,
            allocator: default_allocator(),
            quantum: Duration::from_millis(10),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// `NEW → STARTED → RUNNING → ENDED`. `KILL_REQUESTED` is tracked as a flag rather than
/// a fifth state, since it's observed concurrently with `RUNNING` rather than superseding it
/// until drain actually stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    New,
    Started,
    Running,
    Ended,
}

type Thunk = Box<dyn FnOnce(&Worker) + Send>;

struct Inner {
    state: WorkerState,
    pending_thunks: VecDeque<Thunk>,
    kill_requested: bool,
    run_on_current_thread_used: bool,
}

/// An opaque low-level wait source, e.g. "semaphore reached timepoint N".
pub trait WaitSource: Send + Sync {
    fn is_ready(&self) -> bool;
}

type LowLevelCallback = Box<dyn FnOnce(CoreResult<()>) + Send>;

struct Waiter {
    source: Option<Arc<dyn WaitSource>>,
    deadline: Option<Instant>,
    priority: i32,
    callback: LowLevelCallback,
}

#[derive(PartialEq, Eq)]
struct WaiterKey(i32, u64);
impl Ord for WaiterKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Lower priority value runs first; BinaryHeap is a max-heap, so reverse priority and
        // break ties by insertion sequence (also ascending-first).
        other.0.cmp(&self.0).then(other.1.cmp(&self.1))
    }
}
impl PartialOrd for WaiterKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The Worker's own implementation of the low-level event loop: `wait_one`, `call`,
/// `wait_until`, `drain`. Only ever touched from the Worker thread (enforced by [`Worker`] via
/// a thread-id check), so plain owned collections suffice.
#[derive(Default)]
struct LowLevelLoop {
    waiters: std::collections::HashMap<u64, Waiter>,
    order: BinaryHeap<WaiterKey>,
    next_id: u64,
}

impl LowLevelLoop {
    fn register(
        &mut self,
        source: Option<Arc<dyn WaitSource>>,
        deadline: Option<Instant>,
        priority: i32,
        callback: LowLevelCallback,
    ) {
        let id = self.next_id;
        self.next_id += 1;
        self.waiters.insert(
            id,
            Waiter {
                source,
                deadline,
                priority,
                callback,
            },
        );
        self.order.push(WaiterKey(priority, id));
    }

    /// Fires every waiter whose wait-source is ready or whose deadline has elapsed, within
    /// `quantum` wall-clock time. Returns the next pending deadline, if any, so the Worker
    /// knows how long it may block before the next transact cycle.
    fn drain(&mut self, quantum: Duration) -> Option<Instant> {
        let started = Instant::now();
        let mut next_deadline = None;
        loop {
            let mut fired_any = false;
            let ids: Vec<u64> = self.order.iter().map(|k| k.1).collect();
            for id in ids {
                if Instant::now().duration_since(started) >= quantum {
                    break;
                }
                let Some(ready) = self.waiters.get(&id).map(|w| {
                    let source_ready = w.source.as_ref().map(|s| s.is_ready()).unwrap_or(false);
                    let deadline_hit = w.deadline.map(|d| Instant::now() >= d).unwrap_or(false);
                    source_ready || deadline_hit
                }) else {
                    continue;
                };
                if ready {
                    if let Some(w) = self.waiters.remove(&id) {
                        fired_any = true;
                        (w.callback)(Ok(()));
                    }
                }
            }
            self.order.retain(|k| self.waiters.contains_key(&k.1));
            if !fired_any || Instant::now().duration_since(started) >= quantum {
                break;
            }
        }
        for w in self.waiters.values() {
            if let Some(d) = w.deadline {
                next_deadline = Some(next_deadline.map_or(d, |cur: Instant| cur.min(d)));
            }
        }
        next_deadline
    }
}

/// Single-threaded cooperative executor.
pub struct Worker {
    options: WorkerOptions,
    inner: Mutex<Inner>,
    transact_cv: Condvar,
    ended_cv: Condvar,
    low_level: Mutex<LowLevelLoop>,
    worker_thread_id: Mutex<Option<ThreadId>>,
    thread_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    seq: AtomicU64,
}

impl Worker {
    pub fn new(options: WorkerOptions) -> Arc<Worker> {
        Arc::new(Worker {
            options,
            inner: Mutex::new(Inner {
                state: WorkerState::New,
                pending_thunks: VecDeque::new(),
                kill_requested: false,
                run_on_current_thread_used: false,
            }),
            transact_cv: Condvar::new(),
            ended_cv: Condvar::new(),
            low_level: Mutex::new(LowLevelLoop::default()),
            worker_thread_id: Mutex::new(None),
            thread_handle: Mutex::new(None),
            seq: AtomicU64::new(0),
        })
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Spawns and runs the loop on a dedicated, owned thread.
    pub fn start(self: &Arc<Self>) -> CoreResult<()> {
        if !self.options.owned_thread {
            return Err(CoreError::logic_error(
                "Worker::start requires owned_thread=true",
            ));
        }
        {
            let mut inner = self.inner.lock().expect("worker mutex poisoned");
            if inner.state != WorkerState::New {
                return Err(CoreError::logic_error("Worker already started"));
            }
            inner.state = WorkerState::Started;
        }
        let worker = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(self.options.name.clone())
            .spawn(move || worker.run_loop())
            .map_err(|e| CoreError::runtime_failure(anyhow::anyhow!(e)))?;
        *self.thread_handle.lock().expect("worker mutex poisoned") = Some(handle);
        Ok(())
    }

    /// Runs the loop on the calling thread until [`Worker::kill`].
    pub fn run_on_current_thread(self: &Arc<Self>) -> CoreResult<()> {
        if self.options.owned_thread {
            return Err(CoreError::logic_error(
                "Worker::run_on_current_thread requires owned_thread=false",
            ));
        }
        {
            let mut inner = self.inner.lock().expect("worker mutex poisoned");
            // Kill() before RunOnCurrentThread() is a LogicError on the subsequent call, for
            // symmetry with the owned_thread case.
            if inner.kill_requested {
                return Err(CoreError::logic_error(
                    "Worker killed before RunOnCurrentThread",
                ));
            }
            if inner.run_on_current_thread_used || inner.state != WorkerState::New {
                return Err(CoreError::logic_error(
                    "Worker::run_on_current_thread already used",
                ));
            }
            inner.run_on_current_thread_used = true;
            inner.state = WorkerState::Started;
        }
        self.run_loop();
        Ok(())
    }

    /// Marks the kill flag and wakes the loop. Safe from any thread, idempotent.
    pub fn kill(&self) {
        let mut inner = self.inner.lock().expect("worker mutex poisoned");
        inner.kill_requested = true;
        self.transact_cv.notify_all();
    }

    /// Blocks until the loop's "ended" event fires. `owned_thread` only. Polls in 5-second
    /// slices, logging a warning on each timeout.
    pub fn wait_for_shutdown(&self) -> CoreResult<()> {
        if !self.options.owned_thread {
            return Err(CoreError::logic_error(
                "wait_for_shutdown requires owned_thread=true",
            ));
        }
        let mut inner = self.inner.lock().expect("worker mutex poisoned");
        while inner.state != WorkerState::Ended {
            let (guard, timeout) = self
                .ended_cv
                .wait_timeout(inner, Duration::from_secs(5))
                .expect("worker mutex poisoned");
            inner = guard;
            if timeout.timed_out() && inner.state != WorkerState::Ended {
                warn!(worker = %self.options.name, "WaitForShutdown timed out after 5s, retrying");
            }
        }
        drop(inner);
        if let Some(handle) = self.thread_handle.lock().expect("worker mutex poisoned").take() {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Enqueues `thunk` for FIFO execution on the Worker thread and signals transact. Callable
    /// from any thread.
    pub fn call_threadsafe<F>(&self, thunk: F)
    where
        F: FnOnce(&Worker) + Send + 'static,
    {
        let mut inner = self.inner.lock().expect("worker mutex poisoned");
        inner.pending_thunks.push_back(Box::new(thunk));
        self.transact_cv.notify_all();
    }

    fn assert_on_worker_thread(&self) -> CoreResult<()> {
        let expected = *self
            .worker_thread_id
            .lock()
            .expect("worker mutex poisoned");
        match expected {
            Some(id) if id == std::thread::current().id() => Ok(()),
            Some(_) => Err(CoreError::logic_error(
                "low-level loop operations must run on the Worker thread",
            )),
            None => Err(CoreError::logic_error("Worker loop is not running")),
        }
    }

    /// Registers `cb` to run on the next drain tick, ordered by `priority` (lower runs first).
    /// Must be called on the Worker thread.
    pub fn call_low_level(
        &self,
        priority: i32,
        cb: Box<dyn FnOnce(CoreResult<()>) + Send>,
    ) -> CoreResult<()> {
        self.assert_on_worker_thread()?;
        self.low_level
            .lock()
            .expect("worker mutex poisoned")
            .register(None, Some(Instant::now()), priority, cb);
        Ok(())
    }

    /// Registers a deadline-only waiter. Must be called on the Worker thread.
    pub fn wait_until_low_level(
        &self,
        deadline: Instant,
        cb: Box<dyn FnOnce(CoreResult<()>) + Send>,
    ) -> CoreResult<()> {
        self.assert_on_worker_thread()?;
        self.low_level
            .lock()
            .expect("worker mutex poisoned")
            .register(None, Some(deadline), 0, cb);
        Ok(())
    }

    /// Registers a one-shot wait-source waiter, optionally with an absolute deadline. Must be
    /// called on the Worker thread.
    pub fn wait_one_low_level(
        &self,
        source: Arc<dyn WaitSource>,
        deadline: Option<Instant>,
        cb: Box<dyn FnOnce(CoreResult<()>) + Send>,
    ) -> CoreResult<()> {
        self.assert_on_worker_thread()?;
        self.low_level
            .lock()
            .expect("worker mutex poisoned")
            .register(Some(source), deadline, 0, cb);
        Ok(())
    }

    /// Current wall-clock reading, used to build deadlines for the low-level loop.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    pub fn convert_relative_timeout_to_deadline_ns(&self, relative_ns: u64) -> Instant {
        self.now() + Duration::from_nanos(relative_ns)
    }

    fn run_loop(self: Arc<Self>) {
        *self
            .worker_thread_id
            .lock()
            .expect("worker mutex poisoned") = Some(std::thread::current().id());
        {
            let mut inner = self.inner.lock().expect("worker mutex poisoned");
            inner.state = WorkerState::Running;
        }
        debug!(worker = %self.options.name, "worker loop started");

        loop {
            let next_deadline = {
                let mut low_level = self.low_level.lock().expect("worker mutex poisoned");
                low_level.drain(self.options.quantum)
            };

            let mut inner = self.inner.lock().expect("worker mutex poisoned");
            if inner.kill_requested {
                break;
            }
            if inner.pending_thunks.is_empty() {
                let wait_for = next_deadline
                    .map(|d| d.saturating_duration_since(Instant::now()))
                    .unwrap_or(self.options.quantum)
                    .min(self.options.quantum.max(Duration::from_millis(1)));
                let (guard, _) = self
                    .transact_cv
                    .wait_timeout(inner, wait_for)
                    .expect("worker mutex poisoned");
                inner = guard;
                if inner.kill_requested {
                    break;
                }
            }

            let next_thunks: VecDeque<Thunk> = std::mem::take(&mut inner.pending_thunks);
            drop(inner);

            // Thunks still left in `next_thunks` once Kill() is observed are discarded, not
            // requeued: the currently running thunk always completes, but no further pending
            // thunk starts.
            for thunk in next_thunks {
                trace!(worker = %self.options.name, "draining thunk");
                if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| thunk(&self))) {
                    error!(worker = %self.options.name, ?payload, "thunk panicked");
                }
                if self.inner.lock().expect("worker mutex poisoned").kill_requested {
                    break;
                }
            }
            if self.inner.lock().expect("worker mutex poisoned").kill_requested {
                break;
            }
        }

        let mut inner = self.inner.lock().expect("worker mutex poisoned");
        inner.state = WorkerState::Ended;
        drop(inner);
        self.ended_cv.notify_all();
        debug!(worker = %self.options.name, "worker loop ended");
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}
