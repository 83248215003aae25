//! Interpreter backend that runs each module in a child `python3` process

use super::interpreter::{Interpreter, InterpreterError, ModuleName, OutputChannel, StreamWriter};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Bytes of output kept for the error message of a failed run
const OUTPUT_TAIL_BYTES: usize = 4096;

/// Configuration for the process backend
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Interpreter executable
    pub program: String,
    /// Arguments placed before the module file
    pub args: Vec<String>,
    /// Directory module files are written to and run from
    pub scratch_dir: PathBuf,
}

/// Runs every execution as `program args <scratch>/<module>.py`
pub struct ProcessInterpreter {
    config: ProcessConfig,
    version: String,
}

impl ProcessInterpreter {
    /// Verify the interpreter is runnable and prepare the scratch directory
    pub fn new(config: ProcessConfig) -> Result<Self, InterpreterError> {
        let output = Command::new(&config.program)
            .arg("--version")
            .output()
            .map_err(|e| {
                InterpreterError::Init(format!("cannot run '{}': {}", config.program, e))
            })?;
        if !output.status.success() {
            return Err(InterpreterError::Init(format!(
                "'{} --version' exited with {}",
                config.program, output.status
            )));
        }

        // Older Pythons print the version on stderr
        let version = String::from_utf8_lossy(if output.stdout.is_empty() {
            &output.stderr
        } else {
            &output.stdout
        })
        .trim()
        .to_string();

        std::fs::create_dir_all(&config.scratch_dir).map_err(|e| {
            InterpreterError::Init(format!(
                "cannot create scratch dir {}: {}",
                config.scratch_dir.display(),
                e
            ))
        })?;

        info!(program = %config.program, version = %version, "Process interpreter ready");
        Ok(Self { config, version })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn module_path(&self, module: &ModuleName) -> PathBuf {
        self.config.scratch_dir.join(module.file_name())
    }
}

impl Interpreter for ProcessInterpreter {
    fn name(&self) -> &str {
        &self.config.program
    }

    fn execute(
        &mut self,
        module: &ModuleName,
        source: &str,
        output: &OutputChannel,
    ) -> Result<(), InterpreterError> {
        let path = self.module_path(module);
        std::fs::write(&path, source)?;

        // stdout and stderr share one pipe so chunks keep the order the program
        // wrote them in
        let (reader, writer) = std::io::pipe()?;
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .arg(&path)
            .current_dir(&self.config.scratch_dir)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer)
            .spawn()?;
        debug!(module = %module, pid = child.id(), "Spawned interpreter process");

        // The command and its pipe ends are dropped by now, so the read ends
        // when the child exits
        let pumped = pump(reader, output.writer(), OUTPUT_TAIL_BYTES);
        let status = child.wait()?;
        let tail = pumped?;

        if status.success() {
            Ok(())
        } else {
            Err(InterpreterError::Raised(failure_message(
                &tail,
                &status.to_string(),
            )))
        }
    }

    fn cleanup(&mut self, module: &ModuleName) -> Result<(), InterpreterError> {
        remove_module_file(&self.module_path(module))
    }
}

/// Forward a pipe to `writer` chunk by chunk, keeping the last `keep` bytes
fn pump(
    mut pipe: impl Read,
    mut writer: StreamWriter,
    keep: usize,
) -> Result<String, InterpreterError> {
    let mut buf = [0u8; 8192];
    let mut undecoded: Vec<u8> = Vec::new();
    let mut tail = String::new();

    loop {
        let n = match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        undecoded.extend_from_slice(&buf[..n]);
        let text = take_utf8(&mut undecoded);
        if text.is_empty() {
            continue;
        }
        writer.write(&text);
        keep_tail(&mut tail, &text, keep);
    }

    if !undecoded.is_empty() {
        let rest = String::from_utf8_lossy(&undecoded).into_owned();
        writer.write(&rest);
        keep_tail(&mut tail, &rest, keep);
    }
    writer.flush();
    Ok(tail)
}

fn keep_tail(tail: &mut String, text: &str, keep: usize) {
    tail.push_str(text);
    if tail.len() > keep {
        let mut cut = tail.len() - keep;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}

/// Take the longest decodable prefix, leaving an incomplete trailing sequence
/// in place for the next read; invalid bytes are replaced
fn take_utf8(bytes: &mut Vec<u8>) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => {
            let text = s.to_string();
            bytes.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&bytes[..valid]).into_owned();
            bytes.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            bytes.clear();
            text
        }
    }
}

/// Last non-empty output line (the traceback ends with `ExceptionType: message`),
/// or the exit status when the process printed nothing
fn failure_message(tail: &str, status: &str) -> String {
    tail
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("interpreter {}", status))
}

fn remove_module_file(path: &Path) -> Result<(), InterpreterError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Module file already gone");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
