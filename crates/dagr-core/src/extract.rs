use std::fs::File;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use log::{debug, info, warn};
use thiserror::Error;

/// Name of the directory, next to the archive, that receives its contents.
pub const EXTRACT_DIR_NAME: &str = "extracted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Detect the format from a file name's extension.
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else {
            None
        }
    }

    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(Self::from_file_name)
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported archive format: {}", .path.display())]
    UnsupportedFormat { path: PathBuf },
    #[error("archive entry escapes the extraction directory: {name}")]
    UnsafeEntry { name: String },
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: {source}")]
    Zip {
        context: &'static str,
        #[source]
        source: zip::result::ZipError,
    },
}

impl ExtractError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    fn zip(context: &'static str, source: zip::result::ZipError) -> Self {
        Self::Zip { context, source }
    }

    fn io_with_path(context: &'static str, path: &Path, source: &std::io::Error) -> Self {
        Self::io(
            context,
            std::io::Error::new(source.kind(), format!("{}: {source}", path.display())),
        )
    }
}

/// Unpack `archive` into a sibling `extracted` directory and return it.
///
/// The result is all-or-nothing: on any failure the extraction directory is
/// removed before the error is returned. An entry whose path is absolute or
/// climbs out with `..` rejects the whole archive.
///
/// # Errors
/// Returns an error for unsupported extensions, unreadable or corrupt
/// archives, and filesystem failures.
pub fn extract(archive: &Path) -> Result<PathBuf, ExtractError> {
    let format = ArchiveFormat::from_path(archive).ok_or_else(|| ExtractError::UnsupportedFormat {
        path: archive.to_path_buf(),
    })?;
    let parent = archive.parent().unwrap_or_else(|| Path::new("."));
    let dest = parent.join(EXTRACT_DIR_NAME);

    info!("Extracting update: {}", archive.display());
    std::fs::create_dir_all(&dest).map_err(|error| {
        ExtractError::io_with_path("failed to create extraction directory", &dest, &error)
    })?;

    let result = match format {
        ArchiveFormat::Zip => extract_zip(archive, &dest),
        ArchiveFormat::TarGz => extract_tar_gz(archive, &dest),
    };

    if let Err(error) = result {
        warn!("Extraction failed, removing {}: {error}", dest.display());
        let _ = std::fs::remove_dir_all(&dest);
        return Err(error);
    }

    info!("Extraction completed: {}", dest.display());
    Ok(dest)
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<(), ExtractError> {
    let file = File::open(archive_path).map_err(|error| {
        ExtractError::io_with_path("failed to open zip archive", archive_path, &error)
    })?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|error| ExtractError::zip("failed to read zip archive", error))?;

    if let Some(name) = archive.file_names().find(|name| escapes_root(Path::new(name))) {
        return Err(ExtractError::UnsafeEntry {
            name: name.to_string(),
        });
    }
    debug!("Unpacking {} zip entries", archive.len());
    archive
        .extract(dest)
        .map_err(|error| ExtractError::zip("failed to extract zip archive", error))
}

fn extract_tar_gz(tar_path: &Path, dest: &Path) -> Result<(), ExtractError> {
    let file = File::open(tar_path)
        .map_err(|error| ExtractError::io_with_path("failed to open tar archive", tar_path, &error))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let entries = archive
        .entries()
        .map_err(|error| ExtractError::io("failed to read tar archive", error))?;
    for entry in entries {
        let mut entry = entry.map_err(|error| ExtractError::io("failed to read tar entry", error))?;
        let entry_path = entry
            .path()
            .map(|path| path.into_owned())
            .map_err(|error| ExtractError::io("failed to read tar entry path", error))?;
        if escapes_root(&entry_path) {
            return Err(ExtractError::UnsafeEntry {
                name: entry_path.display().to_string(),
            });
        }

        let unpacked = entry.unpack_in(dest).map_err(|error| {
            ExtractError::io_with_path("failed to extract archive entry", &entry_path, &error)
        })?;
        if !unpacked {
            warn!("Skipped tar entry {}", entry_path.display());
        }
    }

    debug!("Tar extraction complete to {}", dest.display());
    Ok(())
}

fn escapes_root(entry: &Path) -> bool {
    entry
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::path::Path;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::{ArchiveFormat, ExtractError, extract};

    fn write_tar_gz(path: &Path, files: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).expect("archive file should be created");
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, *contents)
                .expect("tar entry should be appended");
        }
        builder
            .into_inner()
            .expect("tar should finish")
            .finish()
            .expect("gzip should finish");
    }

    #[test]
    fn detects_formats_by_extension() {
        assert_eq!(ArchiveFormat::from_file_name("a.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_file_name("a.ZIP"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_file_name("a.tar.gz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_file_name("a.tgz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_file_name("a.tar.xz"), None);
        assert_eq!(ArchiveFormat::from_file_name("a.gz"), None);
    }

    #[test]
    fn extract_tar_gz_into_sibling_directory() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let archive = temp.path().join("update.tar.gz");
        write_tar_gz(
            &archive,
            &[("dagr-1.1.0/VERSION", b"1.1.0"), ("dagr-1.1.0/src/dagr.py", b"print()")],
        );

        let dest = extract(&archive).expect("archive should extract");

        assert_eq!(dest, temp.path().join("extracted"));
        assert_eq!(
            std::fs::read(dest.join("dagr-1.1.0/VERSION")).expect("marker should exist"),
            b"1.1.0"
        );
        assert!(dest.join("dagr-1.1.0/src/dagr.py").is_file());
    }

    fn write_zip(path: &Path, directories: &[&str], files: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).expect("zip file should be created");
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o644);
        for directory in directories {
            writer
                .add_directory(*directory, options)
                .expect("directory entry should be written");
        }
        for (name, contents) in files {
            writer.start_file(*name, options).expect("entry should start");
            writer.write_all(contents).expect("entry should be written");
        }
        writer.finish().expect("zip should finish");
    }

    #[test]
    fn zip_release_unpacks_with_its_wrapper_directory() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let archive = temp.path().join("dagr-2.0.0.zip");
        write_zip(
            &archive,
            &["dagr-2.0.0/", "dagr-2.0.0/logs/"],
            &[
                ("dagr-2.0.0/VERSION", b"2.0.0"),
                ("dagr-2.0.0/install/dagr.service", b"[Unit]"),
            ],
        );

        let dest = extract(&archive).expect("zip should extract");

        assert_eq!(
            std::fs::read_to_string(dest.join("dagr-2.0.0/VERSION")).expect("marker should exist"),
            "2.0.0"
        );
        assert!(dest.join("dagr-2.0.0/install/dagr.service").is_file());
        assert!(dest.join("dagr-2.0.0/logs").is_dir());
    }

    #[test]
    fn zip_entry_climbing_out_rejects_the_archive() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let archive = temp.path().join("dagr-2.0.0.zip");
        write_zip(
            &archive,
            &[],
            &[("dagr-2.0.0/VERSION", b"2.0.0"), ("../dagr.service", b"[Unit]")],
        );

        assert!(matches!(
            extract(&archive),
            Err(ExtractError::UnsafeEntry { name }) if name == "../dagr.service"
        ));
        assert!(!temp.path().join("dagr.service").exists());
        assert!(!temp.path().join("extracted").exists());
    }

    #[test]
    fn tar_entry_climbing_out_rejects_the_archive() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let archive = temp.path().join("dagr-2.0.0.tar.gz");
        let file = std::fs::File::create(&archive).expect("archive file should be created");
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let mut header = tar::Header::new_gnu();
        let contents = b"[Unit]";
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        // `append_data` refuses `..`, so the raw name is written directly.
        let name = b"../dagr.service";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.as_old_mut().name[name.len()..].fill(0);
        header.set_cksum();
        builder
            .append(&header, contents.as_slice())
            .expect("raw entry should be appended");
        builder
            .into_inner()
            .expect("tar should finish")
            .finish()
            .expect("gzip should finish");

        assert!(matches!(
            extract(&archive),
            Err(ExtractError::UnsafeEntry { .. })
        ));
        assert!(!temp.path().join("dagr.service").exists());
        assert!(!temp.path().join("extracted").exists());
    }

    #[test]
    fn unsupported_extension_is_a_format_error() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let archive = temp.path().join("update.rar");
        std::fs::write(&archive, b"rar").expect("archive should be written");

        assert!(matches!(
            extract(&archive),
            Err(ExtractError::UnsupportedFormat { .. })
        ));
        assert!(!temp.path().join("extracted").exists());
    }

    #[test]
    fn corrupt_archive_leaves_no_partial_output() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let archive = temp.path().join("update.tar.gz");
        std::fs::write(&archive, b"definitely not gzip").expect("archive should be written");

        assert!(extract(&archive).is_err());
        assert!(!temp.path().join("extracted").exists());
    }

    #[test]
    fn truncated_zip_leaves_no_partial_output() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let archive = temp.path().join("update.zip");
        std::fs::write(&archive, b"PK\x03\x04 truncated").expect("archive should be written");

        assert!(matches!(extract(&archive), Err(ExtractError::Zip { .. })));
        assert!(!temp.path().join("extracted").exists());
    }
}
