//! Atomic single-value state file I/O.
//!
//! Every write goes to a sibling temp file and is renamed into place, so a
//! reader interleaved with a writer only ever observes the old or the new
//! value, never a partial token. Reads tolerate a missing file by returning
//! `None` ("absent") rather than erroring.

use std::io::Write as _;
use std::path::Path;

use crate::error::{BarnError, BarnResult, IoContext};

/// Write `value` to `path` atomically: write to `<path>.tmp-<pid>`, flush,
/// then rename over `path`. Values are plain UTF-8 text with no trailing
/// whitespace.
pub fn write_atomic(path: &Path, value: &str) -> BarnResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| BarnError::InvalidArgument(format!("no parent dir for {path:?}")))?;
    std::fs::create_dir_all(parent).io_ctx(parent)?;

    let tmp_path = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("state"),
        std::process::id()
    ));

    let write_result = (|| -> BarnResult<()> {
        let mut f = std::fs::File::create(&tmp_path).io_ctx(&tmp_path)?;
        f.write_all(value.as_bytes()).io_ctx(&tmp_path)?;
        f.sync_all().io_ctx(&tmp_path)?;
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }

    std::fs::rename(&tmp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        BarnError::io(path, e)
    })
}

/// Read a single-value file as trimmed UTF-8 text. Returns `Ok(None)` if the
/// file does not exist. A non-UTF-8 file is treated as corrupted rather than
/// failing the whole read path.
pub fn read_optional(path: &Path) -> BarnResult<Option<String>> {
    match std::fs::read(path) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(s) => Ok(Some(s.trim_end().to_string())),
            Err(_) => Err(BarnError::Corrupted(format!(
                "non-utf8 state file: {}",
                path.display()
            ))),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BarnError::io(path, e)),
    }
}

/// Like [`read_optional`] but a missing file is also reported via `Ok(None)`
/// when `Corrupted` should instead propagate as an error to the caller.
pub fn read_required(path: &Path) -> BarnResult<String> {
    read_optional(path)?.ok_or_else(|| BarnError::NotFound(path.display().to_string()))
}

/// Append a line to a log-style file (not state; no atomicity needed since
/// there is exactly one writer per spec's ownership model). Creates the
/// file and parent directories if absent.
pub fn append_line(path: &Path, line: &str) -> BarnResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).io_ctx(parent)?;
    }
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .io_ctx(path)?;
    writeln!(f, "{line}").io_ctx(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_reads_as_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        assert_eq!(read_optional(&path).unwrap(), None);
    }

    #[test]
    fn write_then_read_roundtrips_and_trims_trailing_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        write_atomic(&path, "running").unwrap();
        assert_eq!(read_optional(&path).unwrap(), Some("running".to_string()));
    }

    #[test]
    fn write_leaves_no_tmp_file_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        write_atomic(&path, "queued").unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn append_line_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("progress.log");
        append_line(&path, "hello").unwrap();
        append_line(&path, "world").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "hello\nworld\n");
    }
}
