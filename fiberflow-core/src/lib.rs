//! Core primitives shared by every engine built on top of this crate: device/topology
//! addressing, the frozen per-process [`System`] registry, the single-threaded [`Worker`]
//! event loop, [`Fiber`]/[`ScopedDevice`] device scopes and cross-thread [`Future`]s.

mod device;
mod error;
mod fiber;
mod future;
mod system;
mod worker;

pub use device::{Address, Device, DeviceAffinity};
pub use error::{AnyError, CoreError, CoreResult};
pub use fiber::{DeviceKey, Fiber, FiberHandle, ScopedDevice};
pub use future::{pending as pending_future, Completer, Future};
pub use system::{DefaultHostAllocator, DriverHandle, HostAllocator, System, SystemBuilder};
pub use worker::{WaitSource, Worker, WorkerOptions};

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Once;

    static INIT: Once = Once::new();

    /// Installs a `tracing` subscriber once per test binary so `RUST_LOG` controls output
    /// without every test racing to set the global subscriber.
    pub fn init_tracing() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}
