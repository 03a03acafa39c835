//! Compiler invocation.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use petri_debug_config::{DebuggerSettings, Language};

/// Builds a loadable artifact from a source file.
pub trait CompilerInvoker: Send + Sync {
    /// Compile `source` into `output`. Returns the diagnostics, empty on success.
    fn compile(&self, source: &Path, output: &Path) -> String;
}

pub fn compiler_for(settings: &DebuggerSettings) -> Arc<dyn CompilerInvoker> {
    match settings.language {
        Language::C | Language::Cpp => Arc::new(CommandCompiler::new(
            &settings.compiler,
            settings.compiler_flags.clone(),
        )),
        Language::Lua => Arc::new(LuaCompiler),
    }
}

/// Runs an external C/C++ compiler producing a shared library.
pub struct CommandCompiler {
    program: String,
    flags: Vec<String>,
}

impl CommandCompiler {
    pub fn new(program: &str, flags: Vec<String>) -> Self {
        Self { program: program.to_string(), flags }
    }

    fn command(&self, source: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.flags);
        cmd.args(["-shared", "-fPIC", "-o"]);
        cmd.arg(output);
        cmd.arg(source);
        cmd
    }
}

impl CompilerInvoker for CommandCompiler {
    fn compile(&self, source: &Path, output: &Path) -> String {
        log::debug!("Compiling {} -> {}", source.display(), output.display());

        let result = match self.command(source, output).output() {
            Ok(result) => result,
            Err(e) => return format!("Cannot run {}: {}", self.program, e),
        };
        if result.status.success() {
            return String::new();
        }

        let mut diagnostics = String::from_utf8_lossy(&result.stderr).into_owned();
        diagnostics.push_str(&String::from_utf8_lossy(&result.stdout));
        let diagnostics = diagnostics.trim().to_string();
        if diagnostics.is_empty() {
            format!("{} exited with {}", self.program, result.status)
        } else {
            diagnostics
        }
    }
}

/// Lua chunks need no compiler: check the syntax, then copy the chunk.
pub struct LuaCompiler;

impl CompilerInvoker for LuaCompiler {
    fn compile(&self, source: &Path, output: &Path) -> String {
        let code = match fs::read_to_string(source) {
            Ok(code) => code,
            Err(e) => return format!("Cannot read {}: {}", source.display(), e),
        };

        let lua = mlua::Lua::new();
        if let Err(e) = lua
            .load(code.as_str())
            .set_name(format!("@{}", source.display()))
            .into_function()
        {
            return e.to_string();
        }

        if source != output {
            if let Err(e) = fs::copy(source, output) {
                return format!("Cannot write {}: {}", output.display(), e);
            }
        }
        String::new()
    }
}
