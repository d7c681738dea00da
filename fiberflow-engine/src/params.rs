//! Parameter file registration: extension-based format inference and scope-level dedup.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use fiberflow_core::{CoreError, CoreResult, System};

use crate::vm::ParameterProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterFormat {
    Irpa,
    Gguf,
    Safetensors,
}

/// Maps a file extension to a [`ParameterFormat`], case-insensitively. Returns `None` for
/// anything unrecognized, in which case `LoadOptions::format` must be supplied explicitly.
pub fn infer_format(path: &Path) -> Option<ParameterFormat> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "irpa" => Some(ParameterFormat::Irpa),
        "gguf" => Some(ParameterFormat::Gguf),
        "safetensors" => Some(ParameterFormat::Safetensors),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadOptions {
    pub format: Option<ParameterFormat>,
    #[serde(default = "default_true")]
    pub readable: bool,
    #[serde(default)]
    pub writable: bool,
    #[serde(default = "default_true")]
    pub mmap: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            format: None,
            readable: true,
            writable: false,
            mmap: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ParameterEntry {
    path: PathBuf,
    format: ParameterFormat,
}

/// An opaque parameter index bound to one named scope. Registering the same `(path, format)`
/// pair twice is a documented no-op; this crate only tracks that fact, not parameter
/// *contents* (content caching is out of scope).
pub struct StaticProgramParameters {
    scope_name: String,
    max_concurrent_operations: usize,
    provider: Arc<dyn ParameterProvider>,
    entries: RefCell<Vec<ParameterEntry>>,
}

impl StaticProgramParameters {
    pub fn new(
        _system: &Arc<System>,
        scope_name: impl Into<String>,
        max_concurrent_operations: usize,
        provider: Arc<dyn ParameterProvider>,
    ) -> Self {
        Self {
            scope_name: scope_name.into(),
            max_concurrent_operations,
            provider,
            entries: RefCell::new(Vec::new()),
        }
    }

    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    pub fn max_concurrent_operations(&self) -> usize {
        self.max_concurrent_operations
    }

    /// Registers `path` under this scope. Format is inferred from the extension when
    /// `opts.format` is `None`; inference failure is `InvalidArgument`. Re-registering the same
    /// `(path, format)` pair is a no-op: the file is not reloaded and the provider is not called
    /// again.
    pub fn load(&self, path: impl AsRef<Path>, opts: LoadOptions) -> CoreResult<()> {
        let path = path.as_ref();
        let format = match opts.format {
            Some(format) => format,
            None => infer_format(path).ok_or_else(|| {
                CoreError::invalid_argument(format!(
                    "cannot infer parameter format for {}",
                    path.display()
                ))
            })?,
        };

        let entry = ParameterEntry {
            path: path.to_path_buf(),
            format,
        };
        if self.entries.borrow().contains(&entry) {
            return Ok(());
        }

        // No caching of parameter contents across scopes; every distinct (path, format) pair
        // still round-trips through the provider once per scope.
        self.provider.load(
            path,
            &LoadOptions {
                format: Some(format),
                ..opts
            },
        )?;
        self.entries.borrow_mut().push(entry);
        Ok(())
    }

    pub fn loaded_count(&self) -> usize {
        self.entries.borrow().len()
    }
}
