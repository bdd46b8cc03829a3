use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Number of usable cores. Prefers the affinity set of this process.
pub fn available_cores() -> usize {
    match core_affinity::get_core_ids() {
        Some(ids) if !ids.is_empty() => ids.len(),
        _ => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    }
}

/// Comparison pool size: whatever is left after `reserved` cores for the
/// call itself, capped at `max`, never less than one.
pub fn comparison_threads(cores: usize, reserved: usize, max: usize) -> usize {
    cores.saturating_sub(reserved).min(max).max(1)
}

/// `<dir>/<name>.<extension>`, which must be an existing file.
pub fn resource_path(dir: &Path, name: &str, extension: &str) -> Result<PathBuf> {
    let path = dir.join(format!("{name}.{extension}"));
    if !path.is_file() {
        return Err(Error::ResourceNotFound(path));
    }
    debug!("Using resource {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison_pool_policy() {
        for cores in 1..=4 {
            assert_eq!(comparison_threads(cores, 4, 8), 1);
        }
        assert_eq!(comparison_threads(6, 4, 8), 2);
        assert_eq!(comparison_threads(12, 4, 8), 8);
        assert_eq!(comparison_threads(13, 4, 8), 8);
        assert_eq!(comparison_threads(64, 4, 8), 8);
    }

    #[test]
    fn at_least_one_core() {
        assert!(available_cores() >= 1);
    }

    #[test]
    fn resolves_resources_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foreman_cif.yuv"), [0u8; 16]).unwrap();

        let found = resource_path(dir.path(), "foreman_cif", "yuv").unwrap();
        assert_eq!(found, dir.path().join("foreman_cif.yuv"));

        let missing = resource_path(dir.path(), "paris_qcif", "yuv");
        assert!(matches!(missing, Err(Error::ResourceNotFound(p)) if p.ends_with("paris_qcif.yuv")));
    }
}
