//! Content-addressed directory sync for local deploys.

use std::fs;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::executor::DeployReport;

fn file_digest(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Copy every file under `src` into `dst`, skipping files whose SHA-256
/// already matches. Files only present in `dst` are left alone.
pub fn sync_tree(src: &Path, dst: &Path) -> io::Result<DeployReport> {
    let mut report = DeployReport::default();
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);

        if target.is_file() && file_digest(&target)? == file_digest(entry.path())? {
            report.unchanged += 1;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(entry.path(), &target)?;
        debug!(file = %rel.display(), "deployed");
        report.copied += 1;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_sync_is_a_noop() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("models")).unwrap();
        fs::write(src.path().join("worker.yaml"), "model: tiny\n").unwrap();
        fs::write(src.path().join("models/tiny.bin"), [1u8, 2, 3]).unwrap();

        let first = sync_tree(src.path(), dst.path()).unwrap();
        assert_eq!(first, DeployReport { copied: 2, unchanged: 0 });

        let second = sync_tree(src.path(), dst.path()).unwrap();
        assert_eq!(second, DeployReport { copied: 0, unchanged: 2 });
        assert_eq!(fs::read(dst.path().join("models/tiny.bin")).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn changed_files_are_recopied() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), "v1").unwrap();
        sync_tree(src.path(), dst.path()).unwrap();

        fs::write(src.path().join("a.txt"), "v2").unwrap();
        let report = sync_tree(src.path(), dst.path()).unwrap();
        assert_eq!(report.copied, 1);
        assert_eq!(fs::read_to_string(dst.path().join("a.txt")).unwrap(), "v2");
    }
}
