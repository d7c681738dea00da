//! Program construction: links a module list into one VM context, resolving imports against
//! earlier modules' exports.

use std::collections::HashSet;
use std::sync::Arc;

use fiberflow_core::{CoreError, CoreResult, Fiber};

use crate::invocation::Timelines;
use crate::module::ProgramModule;
use crate::vm::{ExportSignature, Hal, VmContext, VmContextFactory, VmModule};

#[derive(Debug, Clone, Default)]
pub struct ProgramLoadOptions {
    /// When true, the VM context enables per-step execution tracing. This crate never writes
    /// to stderr itself; the flag is forwarded to `VmContextFactory::create_context` verbatim,
    /// the destination is the VM's own concern.
    pub trace_execution: bool,
}

/// A Fiber-bound, linked set of modules. Lives as long as its `Fiber`.
pub struct Program {
    fiber: Arc<Fiber>,
    modules: Vec<ProgramModule>,
    context: Box<dyn VmContext>,
    timelines: Timelines,
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("modules", &self.modules.iter().map(ProgramModule::name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Program {
    /// Links `modules` in order against `factory`. Fails with `InvalidArgument` as soon as a
    /// module's import isn't satisfied by an earlier module's exports: this bookkeeping is
    /// ordinary crate logic, done before the opaque `VmContextFactory` is ever asked to link.
    pub fn load(
        fiber: Arc<Fiber>,
        factory: &dyn VmContextFactory,
        hal: Arc<dyn Hal>,
        modules: Vec<ProgramModule>,
        options: ProgramLoadOptions,
    ) -> CoreResult<Arc<Program>> {
        let mut resolved: HashSet<(String, usize)> = HashSet::new();
        for module in &modules {
            for import in module.imports() {
                let key = (import.name.clone(), import.arity);
                if !resolved.contains(&key) {
                    return Err(CoreError::invalid_argument(format!(
                        "unresolved import {}/{} in module {}",
                        import.name,
                        import.arity,
                        module.name()
                    )));
                }
            }
            for export in module.exports() {
                resolved.insert((export.name.clone(), export.arity));
            }
        }

        let vm_modules: Vec<Arc<dyn VmModule>> =
            modules.iter().map(|m| Arc::clone(m.vm_module())).collect();
        let context = factory.create_context(&vm_modules, options.trace_execution)?;

        Ok(Arc::new(Program {
            fiber,
            modules,
            context,
            timelines: Timelines::new(hal),
        }))
    }

    pub fn fiber(&self) -> &Arc<Fiber> {
        &self.fiber
    }

    pub fn exports(&self) -> impl Iterator<Item = &ExportSignature> {
        self.modules.iter().flat_map(ProgramModule::exports)
    }

    pub(crate) fn vm_context(&self) -> &dyn VmContext {
        self.context.as_ref()
    }

    pub(crate) fn engine_timelines(&self) -> &Timelines {
        &self.timelines
    }
}
