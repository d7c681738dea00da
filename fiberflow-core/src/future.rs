//! A typed future resolved from any thread but observed on its owning Worker.

use std::sync::{Arc, Mutex};

use crate::error::CoreError;
use crate::worker::Worker;

type Continuation<T> = Box<dyn FnOnce(Result<T, CoreError>) + Send>;

enum FutureState<T> {
    Pending(Option<Continuation<T>>),
    Ready(Result<T, CoreError>),
    /// The value/error was already delivered to a registered continuation.
    Consumed,
}

struct Shared<T> {
    worker: Arc<Worker>,
    state: Mutex<FutureState<T>>,
}

/// A future completed exactly once, observed on `worker`.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// The write end of a [`Future`], handed to whoever schedules the work the future represents
/// (typically the Worker's async-invoke completion callback).
pub struct Completer<T> {
    shared: Arc<Shared<T>>,
}

/// Creates a pending future bound to `worker`, plus the [`Completer`] used to resolve it.
pub fn pending<T: Send + 'static>(worker: Arc<Worker>) -> (Future<T>, Completer<T>) {
    let shared = Arc::new(Shared {
        worker,
        state: Mutex::new(FutureState::Pending(None)),
    });
    (
        Future {
            shared: Arc::clone(&shared),
        },
        Completer { shared },
    )
}

impl<T: Send + 'static> Completer<T> {
    /// Resolves the future exactly once. Callable from any thread; the continuation, if
    /// any is registered, always runs on the future's owning Worker because this hands off
    /// through [`Worker::call_threadsafe`] rather than invoking it inline.
    pub fn complete(self, result: Result<T, CoreError>) {
        let shared = self.shared;
        shared.worker.call_threadsafe(move |_| {
            let mut state = shared.state.lock().expect("future mutex poisoned");
            let prior = std::mem::replace(&mut *state, FutureState::Consumed);
            match prior {
                FutureState::Pending(Some(cb)) => {
                    drop(state);
                    cb(result);
                }
                FutureState::Pending(None) => {
                    *state = FutureState::Ready(result);
                }
                FutureState::Ready(_) | FutureState::Consumed => {
                    panic!("Future completed more than once");
                }
            }
        });
    }
}

impl<T: Send + 'static> Future<T> {
    /// Registers `cb` to run with the resolved value, on the owning Worker. If the future is
    /// already resolved, `cb` is still dispatched through `call_threadsafe` rather than called
    /// inline, preserving "observers run on Future's owning worker" regardless of which thread
    /// registered it.
    pub fn on_complete(&self, cb: impl FnOnce(Result<T, CoreError>) + Send + 'static) {
        let shared = Arc::clone(&self.shared);
        let worker = Arc::clone(&shared.worker);
        worker.call_threadsafe(move |_| {
            let mut state = shared.state.lock().expect("future mutex poisoned");
            match std::mem::replace(&mut *state, FutureState::Consumed) {
                FutureState::Pending(None) => {
                    *state = FutureState::Pending(Some(Box::new(cb)));
                }
                FutureState::Pending(Some(_existing)) => {
                    panic!("Future already has a registered observer");
                }
                FutureState::Ready(result) => {
                    drop(state);
                    cb(result);
                }
                FutureState::Consumed => {
                    panic!("Future observer registered after consumption");
                }
            }
        });
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.shared.worker
    }
}
