//! Trait boundaries for the opaque VM/HAL/parameter-provider collaborators this crate drives
//! but does not implement.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use fiberflow_core::{CoreError, Device};

use crate::params::LoadOptions;

/// An opaque VM-side value reference. `raw()` is meaningful only to the `VmContext` that
/// produced it; a null ref (`is_null()`) stands in for a primitive scalar result the VM chose
/// not to box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmRef(u64);

impl VmRef {
    pub fn from_raw(id: u64) -> Self {
        VmRef(id)
    }

    pub fn null() -> Self {
        VmRef(0)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// An owned argument/result list, standing in for the opaque `list_create/append/get` trio:
/// append and get are just `Vec` push/index, so no separate VM trait method is needed.
#[derive(Debug, Clone, Default)]
pub struct VmList(Vec<VmRef>);

impl VmList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn append(&mut self, value: VmRef) {
        self.0.push(value);
    }

    pub fn get(&self, index: usize) -> Option<VmRef> {
        self.0.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<VmRef>> for VmList {
    fn from(values: Vec<VmRef>) -> Self {
        Self(values)
    }
}

/// A wait or signal fence: the set of `(semaphore, timepoint)` pairs a `COARSE_FENCES`
/// invocation blocks on or advances. Built by this crate from per-queue timeline bookkeeping,
/// never by the HAL.
#[derive(Clone, Default)]
pub struct Fence(Vec<(Arc<dyn Semaphore>, u64)>);

impl Fence {
    pub fn from_waits(waits: Vec<(Arc<dyn Semaphore>, u64)>) -> Self {
        Self(waits)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn waits(&self) -> &[(Arc<dyn Semaphore>, u64)] {
        &self.0
    }
}

impl Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|(_, tp)| tp))
            .finish()
    }
}

/// A named export or unresolved import of a [`VmModule`]. Import resolution checks
/// `(name, arity)` equality against the exports of earlier-loaded modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSignature {
    pub name: String,
    pub arity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSignature {
    pub name: String,
    pub arity: usize,
}

/// The opaque compiled module handle. `Program::load` walks `imports()` against prior
/// modules' `exports()` before delegating actual linking to [`VmContextFactory`].
pub trait VmModule: Debug + Send + Sync {
    fn name(&self) -> &str;
    fn exports(&self) -> &[ExportSignature];
    fn imports(&self) -> &[ImportSignature];
}

/// An opaque handle to a function inside a linked [`VmContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmFunctionHandle {
    pub qualified_name: String,
}

/// Function metadata the VM exposes at lookup time; `invocation_model` detection reads
/// `coarse_fences_marker` and `trivially_synchronous`.
#[derive(Debug, Clone, Default)]
pub struct FunctionAttrs {
    pub coarse_fences_marker: bool,
    pub trivially_synchronous: bool,
}

pub trait VmContextFactory: Send + Sync {
    fn create_context(
        &self,
        modules: &[Arc<dyn VmModule>],
        trace_execution: bool,
    ) -> Result<Box<dyn VmContext>, CoreError>;
}

pub trait VmContext: Debug + Send + Sync {
    fn lookup_function(&self, qualified_name: &str) -> Option<(VmFunctionHandle, FunctionAttrs)>;

    /// Schedules an asynchronous invocation. `on_complete` runs on an unspecified thread and
    /// must route failure through its `Result` argument rather than unwinding.
    fn async_invoke(
        &self,
        function: &VmFunctionHandle,
        args: VmList,
        wait_fence: Option<Fence>,
        signal_fence: Option<Fence>,
        on_complete: Box<dyn FnOnce(Result<VmList, CoreError>) + Send>,
    );
}

pub trait Hal: Send + Sync {
    fn semaphore_create(&self, device: &Device) -> Result<Arc<dyn Semaphore>, CoreError>;
}

pub trait Semaphore: Send + Sync + Debug {
    fn signal(&self, timepoint: u64) -> Result<(), CoreError>;
    fn query(&self) -> Result<u64, CoreError>;
}

pub trait ParameterProvider: Send + Sync {
    fn load(&self, path: &Path, opts: &LoadOptions) -> Result<(), CoreError>;
}

/// Compiles a bytecode module from the filesystem into an opaque [`VmModule`] handle; module
/// compilation itself is out of scope and lives entirely behind this collaborator.
pub trait ModuleCompiler: Send + Sync {
    fn compile_from_path(&self, path: &Path, mmap: bool) -> Result<Arc<dyn VmModule>, CoreError>;
}
