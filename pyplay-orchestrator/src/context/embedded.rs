//! In-process Python via PyO3
//!
//! One interpreter lives for the whole session. Every execution is imported as
//! a new module under its synthetic name, with `sys.stdout`/`sys.stderr`
//! swapped for writers that feed the output channel.

use super::interpreter::{Interpreter, InterpreterError, ModuleName, OutputChannel, StreamWriter};
use pyo3::prelude::*;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Configuration for the embedded backend
#[derive(Debug, Clone)]
pub struct EmbeddedConfig {
    pub scratch_dir: PathBuf,
    /// Python run once after the interpreter starts
    pub setup: Option<String>,
    /// Python run after every execution
    pub cleanup_hook: Option<String>,
}

/// Python file-like object that forwards writes to a [`StreamWriter`]
#[pyclass]
struct ChannelWriter {
    writer: Option<StreamWriter>,
}

impl ChannelWriter {
    fn new(writer: StreamWriter) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    /// Flush and detach; later writes from stashed references are dropped
    fn finish(&mut self) {
        self.writer.take();
    }
}

#[pymethods]
impl ChannelWriter {
    fn write(&mut self, text: &str) -> usize {
        if let Some(writer) = self.writer.as_mut() {
            writer.write(text);
        }
        text.chars().count()
    }

    fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush();
        }
    }

    fn isatty(&self) -> bool {
        false
    }

    #[getter]
    fn encoding(&self) -> &'static str {
        "utf-8"
    }
}

/// Long-lived embedded CPython
pub struct EmbeddedInterpreter {
    scratch_dir: PathBuf,
    cleanup_hook: Option<CString>,
}

impl EmbeddedInterpreter {
    pub fn new(config: EmbeddedConfig) -> Result<Self, InterpreterError> {
        std::fs::create_dir_all(&config.scratch_dir)?;
        let setup = to_cstring(config.setup.as_deref())?;
        let cleanup_hook = to_cstring(config.cleanup_hook.as_deref())?;

        pyo3::prepare_freethreaded_python();
        let version = Python::with_gil(|py| -> PyResult<String> {
            py.import("importlib.util")?;
            if let Some(code) = &setup {
                py.run(code, None, None)?;
            }
            Ok(py.version().to_string())
        })
        .map_err(|e| InterpreterError::Init(e.to_string()))?;

        info!(version = %version, "Embedded Python ready");
        Ok(Self {
            scratch_dir: config.scratch_dir,
            cleanup_hook,
        })
    }
}

fn to_cstring(code: Option<&str>) -> Result<Option<CString>, InterpreterError> {
    code.map(|c| {
        CString::new(c).map_err(|e| InterpreterError::Init(format!("invalid snippet: {}", e)))
    })
    .transpose()
}

/// Import `path` as a brand new module called `name`
fn load_module(py: Python<'_>, name: &str, path: &Path) -> PyResult<()> {
    let util = py.import("importlib.util")?;
    let location = path.to_string_lossy();
    let spec = util.call_method1("spec_from_file_location", (name, location.as_ref()))?;
    let module = util.call_method1("module_from_spec", (&spec,))?;
    py.import("sys")?
        .getattr("modules")?
        .set_item(name, &module)?;
    spec.getattr("loader")?
        .call_method1("exec_module", (&module,))?;
    Ok(())
}

/// Traceback plus `Type: message`, as Python would print it
fn describe(py: Python<'_>, err: &PyErr) -> String {
    let traceback = err
        .traceback(py)
        .and_then(|tb| tb.format().ok())
        .unwrap_or_default();
    format!("{}{}", traceback, err)
}

impl Interpreter for EmbeddedInterpreter {
    fn name(&self) -> &str {
        "embedded-python"
    }

    fn execute(
        &mut self,
        module: &ModuleName,
        source: &str,
        output: &OutputChannel,
    ) -> Result<(), InterpreterError> {
        let path = self.scratch_dir.join(module.file_name());
        std::fs::write(&path, source)?;

        Python::with_gil(|py| {
            let host_err = |e: PyErr| InterpreterError::Raised(describe(py, &e));

            let sys = py.import("sys").map_err(host_err)?;
            let saved_stdout = sys.getattr("stdout").map_err(host_err)?;
            let saved_stderr = sys.getattr("stderr").map_err(host_err)?;

            let stdout = Bound::new(py, ChannelWriter::new(output.writer())).map_err(host_err)?;
            let stderr = Bound::new(py, ChannelWriter::new(output.writer())).map_err(host_err)?;
            sys.setattr("stdout", &stdout).map_err(host_err)?;
            sys.setattr("stderr", &stderr).map_err(host_err)?;

            debug!(module = %module, "Executing module");
            let result = load_module(py, module.as_str(), &path);

            let restored = sys
                .setattr("stdout", saved_stdout)
                .and_then(|_| sys.setattr("stderr", saved_stderr));
            stdout.borrow_mut().finish();
            stderr.borrow_mut().finish();

            result.map_err(host_err)?;
            restored.map_err(host_err)
        })
    }

    fn cleanup(&mut self, module: &ModuleName) -> Result<(), InterpreterError> {
        Python::with_gil(|py| -> PyResult<()> {
            let modules = py.import("sys")?.getattr("modules")?;
            if modules.contains(module.as_str())? {
                modules.del_item(module.as_str())?;
            }
            if let Some(hook) = &self.cleanup_hook {
                py.run(hook, None, None)?;
            }
            Ok(())
        })
        .map_err(|e| InterpreterError::Raised(e.to_string()))?;

        let path = self.scratch_dir.join(module.file_name());
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
