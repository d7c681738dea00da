//! Program/Function/Invocation engine built on `fiberflow_core`'s Worker/Fiber/Device
//! primitives: module linking, coarse-fences argument marshalling and the VM/HAL trait
//! boundary consumed by the scheduler.

mod function;
mod invocation;
mod module;
mod params;
mod program;
mod vm;

pub use function::{Function, InvocationModel};
pub use invocation::{Barrier, Invocation, Marshalable};
pub use module::ProgramModule;
pub use params::{infer_format, LoadOptions, ParameterFormat, StaticProgramParameters};
pub use program::{Program, ProgramLoadOptions};
pub use vm::{
    ExportSignature, Fence, FunctionAttrs, Hal, ImportSignature, ModuleCompiler, ParameterProvider,
    Semaphore, VmContext, VmContextFactory, VmFunctionHandle, VmList, VmModule, VmRef,
};

/// Fake VM/HAL/parameter-provider collaborators. Not part of the crate's stable API;
/// exists so both this crate's own tests and the integration suite under `tests/` can build a
/// System/Program/Function without a real VM, behind the `test-util` feature.
#[cfg(any(test, feature = "test-util"))]
pub mod testutil;
