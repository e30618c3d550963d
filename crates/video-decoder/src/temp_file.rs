//! Transient on-disk copy of an uploaded video
//!
//! FFmpeg opens containers by path, so uploaded bytes are written to a uniquely
//! named temporary file first. The file is removed when the `TempVideoFile` is
//! dropped, whichever way the request ends.

use blade_inspect_common::Result;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const TEMP_PREFIX: &str = "blade-inspect-";

/// An uploaded video held in a temporary file that is deleted on drop
#[derive(Debug)]
pub struct TempVideoFile {
    file: NamedTempFile,
}

impl TempVideoFile {
    /// Write `bytes` to a new temporary file inside `dir`
    ///
    /// `suffix` should include the leading dot (e.g. `.mp4`); FFmpeg uses it as
    /// a container hint.
    pub fn from_bytes_in(dir: impl AsRef<Path>, bytes: &[u8], suffix: &str) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(suffix)
            .tempfile_in(dir)?;

        file.write_all(bytes)?;
        file.flush()?;

        debug!(
            "Wrote {} upload bytes to {}",
            bytes.len(),
            file.path().display()
        );

        Ok(Self { file })
    }

    /// Path of the temporary file
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Delete the file now, logging instead of failing if removal fails
    pub fn close(self) {
        let path = self.file.path().to_path_buf();
        if let Err(e) = self.file.close() {
            warn!("Failed to remove temporary video {}: {}", path.display(), e);
        }
    }
}

impl AsRef<Path> for TempVideoFile {
    fn as_ref(&self) -> &Path {
        self.path()
    }
}

/// Pick a container suffix from an uploaded file name, defaulting to `.mp4`
#[must_use]
pub fn suffix_for_upload(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map_or_else(|| ".mp4".to_string(), |ext| format!(".{}", ext.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let temp = TempVideoFile::from_bytes_in(dir.path(), b"not a video", ".mp4").unwrap();
            assert!(temp.path().exists());
            assert_eq!(std::fs::read(temp.path()).unwrap(), b"not a video");
            temp.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_temp_file_close() {
        let dir = tempfile::tempdir().unwrap();
        let temp = TempVideoFile::from_bytes_in(dir.path(), b"abc", ".mov").unwrap();
        let path = temp.path().to_path_buf();
        assert!(path.to_string_lossy().ends_with(".mov"));
        temp.close();
        assert!(!path.exists());
    }

    #[test]
    fn test_concurrent_uploads_get_unique_paths() {
        let dir = tempfile::tempdir().unwrap();
        let a = TempVideoFile::from_bytes_in(dir.path(), b"a", ".mp4").unwrap();
        let b = TempVideoFile::from_bytes_in(dir.path(), b"b", ".mp4").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_suffix_for_upload() {
        assert_eq!(suffix_for_upload(Some("blade.MOV")), ".mov");
        assert_eq!(suffix_for_upload(Some("clip.webm")), ".webm");
        assert_eq!(suffix_for_upload(Some("noext")), ".mp4");
        assert_eq!(suffix_for_upload(Some("weird.m p4")), ".mp4");
        assert_eq!(suffix_for_upload(None), ".mp4");
    }
}
