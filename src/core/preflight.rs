use tracing::{debug, error};

use crate::error::{BackupError, Result};

/// Check that every tool resolves on `PATH`.
///
/// Returns one message per missing tool.
pub fn validate_dependencies<S: AsRef<str>>(tools: &[S]) -> std::result::Result<(), Vec<String>> {
    let mut missing = Vec::new();

    for tool in tools {
        let tool: &str = tool.as_ref();
        match which::which(tool) {
            Ok(path) => debug!(tool, path = %path.display(), "Found required command"),
            Err(_) => missing.push(format!("Required command not found: {}", tool)),
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(missing)
    }
}

pub fn ensure_dependencies<S: AsRef<str>>(tools: &[S]) -> Result<()> {
    validate_dependencies(tools).map_err(|missing| {
        for message in &missing {
            error!("{}", message);
        }
        BackupError::MissingDependencies(missing)
    })
}
