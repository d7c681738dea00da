//! Function handles and invocation-model detection.

use std::sync::Arc;

use fiberflow_core::{CoreError, CoreResult, Fiber};

use crate::program::Program;
use crate::vm::{FunctionAttrs, VmFunctionHandle};

/// How a function expects its arguments to be terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationModel {
    /// The function's last two VM arguments are a wait fence and a signal fence.
    CoarseFences,
    /// The function is trivially synchronous; arguments pass through unchanged.
    None,
    /// Neither attribute was recognized; `Invoke` still runs but device selection and fences
    /// are not injected.
    Unknown,
}

impl InvocationModel {
    fn from_attrs(attrs: &FunctionAttrs) -> Self {
        if attrs.coarse_fences_marker {
            InvocationModel::CoarseFences
        } else if attrs.trivially_synchronous {
            InvocationModel::None
        } else {
            InvocationModel::Unknown
        }
    }
}

/// A resolved function inside a linked [`Program`]. Shares the Program's lifetime.
#[derive(Clone)]
pub struct Function {
    fiber: Arc<Fiber>,
    program: Arc<Program>,
    handle: VmFunctionHandle,
    model: InvocationModel,
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("qualified_name", &self.handle.qualified_name)
            .field("model", &self.model)
            .finish()
    }
}

impl Function {
    /// Looks up `qualified_name` (`module.function`) in `program`. `None` on miss: lookup
    /// failure is not an error.
    pub fn lookup(program: &Arc<Program>, qualified_name: &str) -> Option<Function> {
        let (handle, attrs) = program.vm_context().lookup_function(qualified_name)?;
        Some(Function {
            fiber: Arc::clone(program.fiber()),
            program: Arc::clone(program),
            model: InvocationModel::from_attrs(&attrs),
            handle,
        })
    }

    /// As [`lookup`](Self::lookup), but turns a miss into `InvalidArgument`.
    pub fn lookup_required(program: &Arc<Program>, qualified_name: &str) -> CoreResult<Function> {
        Self::lookup(program, qualified_name).ok_or_else(|| {
            CoreError::invalid_argument(format!("unknown function {qualified_name}"))
        })
    }

    pub fn fiber(&self) -> &Arc<Fiber> {
        &self.fiber
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn invocation_model(&self) -> InvocationModel {
        self.model
    }

    pub(crate) fn vm_handle(&self) -> &VmFunctionHandle {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeVmContext;
    use crate::vm::{VmContextFactory, VmList, VmModule, VmRef};

    struct FakeFactory;
    impl VmContextFactory for FakeFactory {
        fn create_context(
            &self,
            _modules: &[Arc<dyn VmModule>],
            _trace_execution: bool,
        ) -> CoreResult<Box<dyn crate::vm::VmContext>> {
            let ctx = FakeVmContext::new();
            ctx.register(
                "m.add",
                FunctionAttrs {
                    trivially_synchronous: true,
                    ..Default::default()
                },
                |args: &VmList| {
                    let _ = args;
                    Ok(VmList::from(vec![VmRef::from_raw(1)]))
                },
            );
            Ok(Box::new(ctx))
        }
    }

    fn program() -> Arc<Program> {
        let (system, device) = crate::testutil::single_device_system();
        let worker = fiberflow_core::Worker::new(fiberflow_core::WorkerOptions::default());
        let fiber = Fiber::new(worker, system, [device]).unwrap();
        Program::load(fiber, &FakeFactory, Arc::new(crate::testutil::FakeHal), vec![], crate::program::ProgramLoadOptions::default())
            .unwrap()
    }

    #[test]
    fn lookup_missing_function_returns_none() {
        let program = program();
        assert!(Function::lookup(&program, "m.absent").is_none());
    }

    #[test]
    fn lookup_required_missing_function_errors() {
        let program = program();
        assert!(Function::lookup_required(&program, "m.absent").is_err());
    }

    #[test]
    fn found_function_reports_invocation_model() {
        let program = program();
        let f = Function::lookup_required(&program, "m.add").unwrap();
        assert_eq!(f.invocation_model(), InvocationModel::None);
    }
}
