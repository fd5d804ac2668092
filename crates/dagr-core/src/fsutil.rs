use std::io::Write;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Write `data` to `path` through a sibling temp file and a rename, so
/// readers never observe a half-written file.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("file");
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    let pid = std::process::id();

    let mut tmp_path = None;
    for attempt in 0..16_u8 {
        let candidate = parent.join(format!(".{file_name}.{pid}.{timestamp}.{attempt}.tmp"));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(mut file) => {
                file.write_all(data)?;
                file.sync_all()?;
                tmp_path = Some(candidate);
                break;
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(error) => return Err(error),
        }
    }

    let Some(tmp_path) = tmp_path else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "failed to create unique temp file",
        ));
    };

    if let Err(error) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(error);
    }

    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub(crate) fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &data)
}

/// Every regular file below `root`, as paths relative to `root`, in a stable
/// order.
pub(crate) fn relative_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(std::io::Error::other)?
            .to_path_buf();
        files.push(relative);
    }
    Ok(files)
}

/// Copy `src` to `dest`, creating missing parent directories.
pub(crate) fn copy_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dest).map(|_| ())
}

/// Render a relative path with `/` separators on every platform.
pub(crate) fn slash_path(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{copy_file, relative_files, slash_path, write_atomic};

    #[test]
    fn write_atomic_replaces_existing_file_without_leftovers() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("version_info.json");
        std::fs::write(&path, "old").expect("seed file should be written");

        write_atomic(&path, b"new").expect("atomic write should succeed");

        assert_eq!(std::fs::read(&path).expect("file should be readable"), b"new");
        let leftovers = std::fs::read_dir(temp.path())
            .expect("read temp dir entries")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn relative_files_lists_nested_files_only() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        copy_file(&write(temp.path(), "seed"), &temp.path().join("tree/src/a.py"))
            .expect("nested copy should create parents");
        std::fs::create_dir_all(temp.path().join("tree/empty")).expect("dir should be created");
        std::fs::write(temp.path().join("tree/VERSION"), "1.0.0").expect("marker written");

        let files = relative_files(&temp.path().join("tree")).expect("walk should succeed");

        assert_eq!(
            files,
            vec![PathBuf::from("VERSION"), PathBuf::from("src").join("a.py")]
        );
    }

    #[test]
    fn slash_path_joins_components() {
        let path = PathBuf::from("config").join("backups").join("b1");
        assert_eq!(slash_path(&path), "config/backups/b1");
    }

    fn write(dir: &std::path::Path, contents: &str) -> PathBuf {
        let path = dir.join("seed.txt");
        std::fs::write(&path, contents).expect("seed should be written");
        path
    }
}
