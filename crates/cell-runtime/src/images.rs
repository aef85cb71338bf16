//! Camera image archive.
//!
//! Directory listing and copies run on the blocking pool.

use crate::blocking_fs;
use cell_common::config::FilesConfig;
use cell_common::{CellError, CellResult};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What happened to a matched image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    /// Copied to the backup directory; holds the new path.
    Archived(PathBuf),
    /// Deleted by someone else between search and copy.
    Vanished(PathBuf),
}

/// Moves camera images into the backup directory.
#[derive(Debug, Clone)]
pub struct ImageArchive {
    camera_dir: PathBuf,
    backup_dir: PathBuf,
}

impl ImageArchive {
    /// Archive between two directories.
    #[must_use]
    pub fn new(camera_dir: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            camera_dir: camera_dir.into(),
            backup_dir: backup_dir.into(),
        }
    }

    /// Archive for the `[files]` section.
    #[must_use]
    pub fn from_config(files: &FilesConfig) -> Self {
        Self::new(&files.camera_dir, &files.backup_dir)
    }

    /// Directory searched for images.
    #[must_use]
    pub fn camera_dir(&self) -> &Path {
        &self.camera_dir
    }

    /// First file (by name) in the camera directory whose name contains `pattern`.
    ///
    /// # Errors
    ///
    /// [`CellError::Io`] when the directory cannot be listed.
    pub async fn find(&self, pattern: &str) -> CellResult<Option<PathBuf>> {
        let camera_dir = self.camera_dir.clone();
        let pattern = pattern.to_string();
        blocking_fs(move || find_in(&camera_dir, &pattern)).await
    }

    /// Copy the matching image to the backup directory, then delete the source.
    ///
    /// # Errors
    ///
    /// [`CellError::ImageNotFound`] when nothing matches, [`CellError::Io`]
    /// when the copy fails for any other reason than a vanished source.
    pub async fn archive(&self, pattern: &str) -> CellResult<ImageOutcome> {
        let archive = self.clone();
        let pattern = pattern.to_string();
        blocking_fs(move || archive.archive_blocking(&pattern)).await
    }

    fn archive_blocking(&self, pattern: &str) -> CellResult<ImageOutcome> {
        let Some(source) = find_in(&self.camera_dir, pattern)? else {
            return Err(CellError::ImageNotFound {
                pattern: pattern.to_string(),
            });
        };
        let Some(name) = source.file_name() else {
            return Err(CellError::ImageNotFound {
                pattern: pattern.to_string(),
            });
        };

        fs::create_dir_all(&self.backup_dir)?;
        let target = self.backup_dir.join(name);
        match fs::copy(&source, &target) {
            Ok(bytes) => debug!(source = %source.display(), bytes, "Image copied"),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ImageOutcome::Vanished(source)),
            Err(e) => return Err(e.into()),
        }
        match fs::remove_file(&source) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(source = %source.display(), error = %e, "Failed to remove archived image"),
        }
        Ok(ImageOutcome::Archived(target))
    }
}

fn find_in(camera_dir: &Path, pattern: &str) -> CellResult<Option<PathBuf>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    let entries = match fs::read_dir(camera_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(dir = %camera_dir.display(), "Camera directory missing");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let mut matches: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .filter(|entry| entry.file_name().to_string_lossy().contains(pattern))
        .map(|entry| entry.path())
        .collect();
    matches.sort();
    Ok(matches.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(dir: &Path) -> ImageArchive {
        ImageArchive::new(dir.join("cameraimage"), dir.join("img_backups"))
    }

    #[tokio::test]
    async fn test_archive_moves_matching_image() {
        let dir = tempfile::tempdir().unwrap();
        let images = archive(dir.path());
        fs::create_dir_all(images.camera_dir()).unwrap();
        fs::write(images.camera_dir().join("cam_240615XX0007_1.bmp"), b"img").unwrap();
        fs::write(images.camera_dir().join("cam_240615XX0008_1.bmp"), b"other").unwrap();

        let outcome = images.archive("240615XX0007").await.unwrap();
        let target = dir.path().join("img_backups/cam_240615XX0007_1.bmp");
        assert_eq!(outcome, ImageOutcome::Archived(target.clone()));
        assert_eq!(fs::read(target).unwrap(), b"img");
        assert!(!images.camera_dir().join("cam_240615XX0007_1.bmp").exists());
        assert!(images.camera_dir().join("cam_240615XX0008_1.bmp").exists());
    }

    #[tokio::test]
    async fn test_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        let images = archive(dir.path());
        fs::create_dir_all(images.camera_dir()).unwrap();

        let err = images.archive("240615XX0007").await.unwrap_err();
        assert_eq!(
            err,
            CellError::ImageNotFound {
                pattern: "240615XX0007".into()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_camera_dir_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let images = archive(dir.path());
        assert_eq!(images.find("X").await.unwrap(), None);
        assert_eq!(images.find("").await.unwrap(), None);
    }
}
