//! Request validation. These checks run before any side effect: a rejected
//! request must leave no volume or record behind.

use crate::error::TeeError;
use crate::types::SetupRequest;

pub const MAX_MODULE_NAME_LEN: usize = 255;

const SHELL_METACHARACTERS: &str = ";|&$`(){}<>\n\r";

/// A module filename is safe when it is relative, free of parent traversal,
/// and restricted to `[A-Za-z0-9._/-]`.
pub fn is_valid_module_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_MODULE_NAME_LEN {
        return false;
    }
    if name.starts_with('/') || name.contains("..") {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
}

/// Dependency specifiers end up as single argv entries, never inside a shell
/// string, but metacharacters are rejected outright anyway.
pub fn contains_shell_metacharacters(s: &str) -> bool {
    s.chars().any(|c| SHELL_METACHARACTERS.contains(c))
}

/// Full validation of a setup request.
pub fn validate_setup(req: &SetupRequest) -> Result<(), TeeError> {
    if req.main_module.is_empty() {
        return Err(TeeError::Validation("mainModule is required".to_string()));
    }
    if req.modules.is_empty() {
        return Err(TeeError::Validation("modules cannot be empty".to_string()));
    }
    if !req.modules.contains_key(&req.main_module) {
        return Err(TeeError::Validation(
            "mainModule must exist in modules map".to_string(),
        ));
    }
    for filename in req.modules.keys() {
        if !is_valid_module_name(filename) {
            return Err(TeeError::Validation(format!(
                "invalid module filename: {filename}"
            )));
        }
    }
    if let Some(deps) = &req.dependencies {
        for pkg in &deps.npm {
            if contains_shell_metacharacters(pkg) {
                return Err(TeeError::Validation(format!(
                    "invalid npm package name: {pkg}"
                )));
            }
        }
        for url in &deps.deno {
            if contains_shell_metacharacters(url) {
                return Err(TeeError::Validation(format!(
                    "invalid deno module URL: {url}"
                )));
            }
        }
    }
    Ok(())
}
