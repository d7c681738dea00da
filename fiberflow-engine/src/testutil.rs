//! Fake VM/HAL/parameter-provider collaborators used only by this crate's own tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fiberflow_core::{CoreError, CoreResult, Device, System};

use crate::params::LoadOptions;
use crate::vm::{
    FunctionAttrs, Hal, ParameterProvider, Semaphore, VmContext, VmFunctionHandle, VmList,
};

/// An `AtomicU64` tip behind the [`Semaphore`] trait.
#[derive(Debug)]
pub struct FakeSemaphore {
    tip: AtomicU64,
}

impl FakeSemaphore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tip: AtomicU64::new(0),
        })
    }
}

impl Semaphore for FakeSemaphore {
    fn signal(&self, timepoint: u64) -> CoreResult<()> {
        self.tip.store(timepoint, Ordering::SeqCst);
        Ok(())
    }

    fn query(&self) -> CoreResult<u64> {
        Ok(self.tip.load(Ordering::SeqCst))
    }
}

pub struct FakeHal;

impl Hal for FakeHal {
    fn semaphore_create(&self, _device: &Device) -> CoreResult<Arc<dyn Semaphore>> {
        Ok(FakeSemaphore::new())
    }
}

pub struct NoopParameterProvider;

impl ParameterProvider for NoopParameterProvider {
    fn load(&self, _path: &Path, _opts: &LoadOptions) -> CoreResult<()> {
        Ok(())
    }
}

type Compute = Arc<dyn Fn(&VmList) -> CoreResult<VmList> + Send + Sync>;

#[derive(Clone)]
struct FakeFunction {
    handle: VmFunctionHandle,
    attrs: FunctionAttrs,
    compute: Compute,
}

/// A registry of `qualified_name -> (handle, attrs, what it computes)` standing in for a real
/// VM context, so e.g. `m.add` can be expressed directly as `|args| args[0] + args[1]`.
#[derive(Default)]
pub struct FakeVmContext {
    functions: Mutex<HashMap<String, FakeFunction>>,
}

impl std::fmt::Debug for FakeVmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeVmContext").finish_non_exhaustive()
    }
}

impl FakeVmContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        qualified_name: impl Into<String>,
        attrs: FunctionAttrs,
        compute: impl Fn(&VmList) -> CoreResult<VmList> + Send + Sync + 'static,
    ) {
        let qualified_name = qualified_name.into();
        self.functions.lock().expect("poisoned").insert(
            qualified_name.clone(),
            FakeFunction {
                handle: VmFunctionHandle { qualified_name },
                attrs,
                compute: Arc::new(compute),
            },
        );
    }
}

impl VmContext for FakeVmContext {
    fn lookup_function(&self, qualified_name: &str) -> Option<(VmFunctionHandle, FunctionAttrs)> {
        self.functions
            .lock()
            .expect("poisoned")
            .get(qualified_name)
            .map(|f| (f.handle.clone(), f.attrs.clone()))
    }

    fn async_invoke(
        &self,
        function: &VmFunctionHandle,
        args: VmList,
        _wait_fence: Option<crate::vm::Fence>,
        signal_fence: Option<crate::vm::Fence>,
        on_complete: Box<dyn FnOnce(Result<VmList, CoreError>) + Send>,
    ) {
        let found = self
            .functions
            .lock()
            .expect("poisoned")
            .get(&function.qualified_name)
            .cloned();

        // A real VM completes this asynchronously on its own thread; the fake runs inline,
        // which is sufficient since callers only observe completion via `on_complete`/`Future`.
        let result = match found {
            Some(f) => (f.compute)(&args),
            None => Err(CoreError::invalid_argument(format!(
                "unknown function {}",
                function.qualified_name
            ))),
        };

        if result.is_ok() {
            if let Some(signal) = &signal_fence {
                for (sem, timepoint) in signal.waits() {
                    let _ = sem.signal(*timepoint);
                }
            }
        }

        on_complete(result);
    }
}

/// A System with one device `cpu:0:0@0` (used by S1).
pub fn single_device_system() -> (Arc<System>, Arc<Device>) {
    let device = Device::new(
        fiberflow_core::Address::new("cpu", "cpu", "test", 0, 0, vec![0]),
        Box::new(()),
        None,
        false,
    );
    let system = fiberflow_core::SystemBuilder::new()
        .add_device(device.clone())
        .build()
        .expect("single_device_system");
    (system, device)
}

/// A System with two devices on distinct instances of the same `system_class` (used by S3).
pub fn two_instance_system() -> (Arc<System>, Arc<Device>, Arc<Device>) {
    let a = Device::new(
        fiberflow_core::Address::new("gpu", "gpu", "test", 0, 0, vec![0]),
        Box::new(()),
        None,
        false,
    );
    let b = Device::new(
        fiberflow_core::Address::new("gpu", "gpu", "test", 1, 0, vec![0]),
        Box::new(()),
        None,
        false,
    );
    let system = fiberflow_core::SystemBuilder::new()
        .add_device(a.clone())
        .add_device(b.clone())
        .build()
        .expect("two_instance_system");
    (system, a, b)
}
