use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::warn;

mod export;
#[cfg(feature = "pdf")]
mod pdfium;

pub use export::{save_png, to_rgba_image};
#[cfg(feature = "pdf")]
pub use pdfium::PdfiumProvider;

/// Candidate locations of the pdfium shared library, in binding order.
///
/// An explicit path may name the library file itself or the directory
/// holding it. The working directory is tried next; the system library
/// search path comes last and is not listed here.
pub fn pdfium_library_candidates(explicit: Option<&Path>, platform_name: &str) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        if path.is_dir() {
            candidates.push(path.join(platform_name));
        } else {
            candidates.push(path.to_path_buf());
        }
    }
    let cwd = Path::new("./").join(platform_name);
    if !candidates.contains(&cwd) {
        candidates.push(cwd);
    }
    candidates
}

/// Tries each candidate with `bind`, then `system`; collects every failure.
pub(crate) fn bind_first<T, E, B, S>(candidates: &[PathBuf], mut bind: B, system: S) -> Result<T>
where
    E: std::fmt::Display,
    B: FnMut(&Path) -> std::result::Result<T, E>,
    S: FnOnce() -> std::result::Result<T, E>,
{
    let mut errors = Vec::new();
    for candidate in candidates {
        match bind(candidate) {
            Ok(bound) => return Ok(bound),
            Err(err) => {
                warn!(path = %candidate.display(), %err, "pdfium not found at candidate path");
                errors.push(format!("{}: {err}", candidate.display()));
            }
        }
    }
    system()
        .map_err(|err| {
            errors.push(format!("system: {err}"));
            anyhow!(
                "failed to bind to a pdfium library; set render.pdfium_library or install it ({})",
                errors.join(", ")
            )
        })
        .context("pdfium is required to open documents")
}
