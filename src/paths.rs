use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Resolve the engine install directory.
///
/// An explicit configured directory wins. Otherwise the engine is expected
/// next to the running executable, the way the vendor tools are laid out.
pub fn resolve_install_dir(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = configured {
        return Ok(dir.to_path_buf());
    }
    let exe = std::env::current_exe().context("failed to locate the running executable")?;
    exe.parent()
        .map(Path::to_path_buf)
        .with_context(|| format!("executable has no parent directory: {}", exe.display()))
}

/// Full path of the implicit-send library the engine loads for prompts.
pub fn implicit_send_library(install_dir: &Path, library: &str) -> PathBuf {
    install_dir.join(library)
}
