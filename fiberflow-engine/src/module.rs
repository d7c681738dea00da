//! Module loading: opaque bytecode modules, and parameter scopes re-exposed as modules so they
//! can satisfy later modules' imports.

use std::path::Path;
use std::sync::Arc;

use fiberflow_core::CoreResult;

use crate::params::StaticProgramParameters;
use crate::vm::{ExportSignature, ImportSignature, ModuleCompiler, VmModule};

/// A [`VmModule`] synthesized from a set of parameter scopes: it declares no imports and one
/// zero-arity export per scope, just enough for `Program::load`'s import walk to recognize that
/// a later module's parameter import is satisfied.
#[derive(Debug)]
struct ParameterVmModule {
    name: String,
    exports: Vec<ExportSignature>,
}

impl ParameterVmModule {
    fn new(params: &[Arc<StaticProgramParameters>]) -> Self {
        let name = params
            .iter()
            .map(|p| p.scope_name())
            .collect::<Vec<_>>()
            .join("+");
        let exports = params
            .iter()
            .map(|p| ExportSignature {
                name: format!("{}.params", p.scope_name()),
                arity: 0,
            })
            .collect();
        Self { name, exports }
    }
}

impl VmModule for ParameterVmModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn exports(&self) -> &[ExportSignature] {
        &self.exports
    }

    fn imports(&self) -> &[ImportSignature] {
        &[]
    }
}

/// A loaded module, immutable once constructed and shareable across [`Program`](crate::program::Program)s.
#[derive(Debug, Clone)]
pub struct ProgramModule {
    inner: Arc<dyn VmModule>,
}

impl ProgramModule {
    /// Loads bytecode from `path`, delegating actual compilation to `compiler`.
    pub fn load(compiler: &dyn ModuleCompiler, path: &Path, mmap: bool) -> CoreResult<Self> {
        let inner = compiler.compile_from_path(path, mmap)?;
        Ok(Self { inner })
    }

    /// Wraps a set of parameter scopes as a module satisfying later imports.
    pub fn from_parameters(params: &[Arc<StaticProgramParameters>]) -> Self {
        Self {
            inner: Arc::new(ParameterVmModule::new(params)),
        }
    }

    pub fn vm_module(&self) -> &Arc<dyn VmModule> {
        &self.inner
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn exports(&self) -> &[ExportSignature] {
        self.inner.exports()
    }

    pub fn imports(&self) -> &[ImportSignature] {
        self.inner.imports()
    }
}
