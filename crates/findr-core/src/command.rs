//! External reduction command construction.
//!
//! Commands are kept as a program plus an argument list and are never passed
//! through a shell. The rendered form doubles as the task tag.

use std::ffi::OsStr;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{CoreError, TaskTag};

/// A fully formed external command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceCommand {
    /// Program to execute (a bare name is looked up on PATH).
    pub program: String,

    /// Arguments, passed verbatim.
    pub args: Vec<String>,
}

impl ReduceCommand {
    /// Create a command from a program and its arguments.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build `<klip_reduce> -c <config_basename>`.
    ///
    /// The config is staged next to the command under its basename, so only
    /// the basename appears on the command line.
    pub fn klip_reduce(klip_reduce: &str, config_path: &Path) -> Result<Self, CoreError> {
        let name = file_name_of(config_path)?;
        Ok(Self::new(klip_reduce, vec!["-c".to_string(), name]))
    }

    /// Rendered command line, used as the correlation tag.
    pub fn tag(&self) -> TaskTag {
        TaskTag::new(self.to_string())
    }
}

impl fmt::Display for ReduceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Basename of a path as an owned UTF-8 string.
pub fn file_name_of(path: &Path) -> Result<String, CoreError> {
    path.file_name()
        .and_then(OsStr::to_str)
        .map(str::to_owned)
        .ok_or_else(|| CoreError::InvalidPath(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_klip_reduce_uses_basename() {
        let cmd = ReduceCommand::klip_reduce("klipReduce", Path::new("configs/run1/a.cfg")).unwrap();
        assert_eq!(cmd.program, "klipReduce");
        assert_eq!(cmd.args, vec!["-c", "a.cfg"]);
        assert_eq!(cmd.tag().as_str(), "klipReduce -c a.cfg");
    }

    #[test]
    fn test_klip_reduce_keeps_program_path() {
        let cmd = ReduceCommand::klip_reduce("/opt/klip/bin/klipReduce", Path::new("b.cfg")).unwrap();
        assert_eq!(cmd.to_string(), "/opt/klip/bin/klipReduce -c b.cfg");
    }

    #[test]
    fn test_config_without_file_name() {
        let result = ReduceCommand::klip_reduce("klipReduce", Path::new(".."));
        assert!(matches!(result, Err(CoreError::InvalidPath(_))));
    }
}
