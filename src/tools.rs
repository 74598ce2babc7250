//! Locating and running the external dclab-style command line tools.

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Output};

use crate::error::DepotError;

/// How a tool invocation ended.
#[derive(Debug)]
pub enum ToolExit {
    Success(Output),
    Failed { code: Option<i32>, stderr: String },
    Interrupted,
}

/// Resolves `name` either as a path to an existing file or via `PATH`.
pub fn resolve_tool(name: &str) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.components().count() > 1 {
        return direct.is_file().then(|| direct.to_path_buf());
    }
    find_in_path(name)
}

pub fn require_tool(name: &str) -> Result<PathBuf, DepotError> {
    resolve_tool(name).ok_or_else(|| DepotError::MissingTool(name.to_string()))
}

pub fn run_tool(program: &Path, args: &[&Path]) -> Result<ToolExit, DepotError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|err| DepotError::MissingTool(format!("{}: {err}", program.display())))?;
    if output.status.success() {
        return Ok(ToolExit::Success(output));
    }
    if killed_by_interrupt(&output.status) {
        return Ok(ToolExit::Interrupted);
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stderr = if stderr.is_empty() {
        format!("command failed: {}", program.display())
    } else {
        stderr
    };
    Ok(ToolExit::Failed {
        code: output.status.code(),
        stderr,
    })
}

#[cfg(unix)]
fn killed_by_interrupt(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    // SIGINT
    status.signal() == Some(2)
}

#[cfg(not(unix))]
fn killed_by_interrupt(_status: &ExitStatus) -> bool {
    false
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
