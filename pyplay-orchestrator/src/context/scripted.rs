//! Line-oriented stand-in interpreter for tests
//!
//! Each source line is a command:
//! `print <text>` writes to stdout, `err <text>` writes to stderr,
//! `raise <message>` fails the run, `panic` panics inside the binding.

use super::interpreter::{
    Interpreter, InterpreterError, InterpreterFactory, ModuleName, OutputChannel,
};
use std::sync::{Arc, Mutex};

pub(crate) type Cleaned = Arc<Mutex<Vec<ModuleName>>>;

pub(crate) struct ScriptedInterpreter {
    cleaned: Cleaned,
}

impl Interpreter for ScriptedInterpreter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn execute(
        &mut self,
        _module: &ModuleName,
        source: &str,
        output: &OutputChannel,
    ) -> Result<(), InterpreterError> {
        let mut stdout = output.writer();
        let mut stderr = output.writer();
        for line in source.lines() {
            if let Some(text) = line.strip_prefix("print ") {
                stdout.write(&format!("{text}\n"));
            } else if let Some(text) = line.strip_prefix("err ") {
                stderr.write(&format!("{text}\n"));
            } else if let Some(message) = line.strip_prefix("raise ") {
                return Err(InterpreterError::Raised(message.to_string()));
            } else if line == "panic" {
                panic!("binding exploded");
            }
        }
        Ok(())
    }

    fn cleanup(&mut self, module: &ModuleName) -> Result<(), InterpreterError> {
        if let Ok(mut cleaned) = self.cleaned.lock() {
            cleaned.push(module.clone());
        }
        Ok(())
    }
}

/// Factory for a scripted interpreter plus the list of modules it cleaned up
pub(crate) fn scripted() -> (InterpreterFactory, Cleaned) {
    let cleaned: Cleaned = Arc::default();
    let shared = cleaned.clone();
    let factory: InterpreterFactory = Box::new(move || {
        Ok(Box::new(ScriptedInterpreter { cleaned: shared }) as Box<dyn Interpreter>)
    });
    (factory, cleaned)
}
