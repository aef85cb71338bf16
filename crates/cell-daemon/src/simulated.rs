//! Scanner stand-in for simulated runs.

use async_trait::async_trait;
use cell_common::{CellError, CellResult, NG};
use cell_scanner::ScannerPort;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Reads back whatever the marking controller was asked to mark.
///
/// The first scan sees a blank part. The verification scan returns the
/// content of the code file with grade `A` and, like the station camera,
/// leaves an image of the marking in the camera directory.
#[derive(Debug, Clone)]
pub struct CodeFileScanner {
    code_file: PathBuf,
    camera_dir: PathBuf,
}

impl CodeFileScanner {
    pub fn new(code_file: &Path, camera_dir: &Path) -> Self {
        Self {
            code_file: code_file.to_path_buf(),
            camera_dir: camera_dir.to_path_buf(),
        }
    }

    fn verify(&self) -> String {
        let code = match std::fs::read_to_string(&self.code_file) {
            Ok(code) if !code.trim().is_empty() => code.trim().to_string(),
            Ok(_) => return NG.to_string(),
            Err(e) => {
                debug!(path = %self.code_file.display(), error = %e, "Code file unreadable");
                return NG.to_string();
            }
        };
        let image = self.camera_dir.join(format!("cam_{code}_1.bmp"));
        if let Err(e) = std::fs::create_dir_all(&self.camera_dir).and_then(|()| std::fs::write(&image, b"BM")) {
            warn!(path = %image.display(), error = %e, "Failed to leave simulated camera image");
        }
        format!("{code}A")
    }
}

#[async_trait]
impl ScannerPort for CodeFileScanner {
    async fn get_reading(&self, expect_second_line: bool) -> CellResult<String> {
        if !expect_second_line {
            return Ok(NG.to_string());
        }
        let scanner = self.clone();
        tokio::task::spawn_blocking(move || scanner.verify())
            .await
            .map_err(|e| CellError::Io(format!("simulated scan failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_back_code_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("code.txt");
        let camera = dir.path().join("cameraimage");
        let scanner = CodeFileScanner::new(&path, &camera);

        assert_eq!(scanner.get_reading(true).await.unwrap(), NG);
        assert!(!camera.exists());

        std::fs::write(&path, "240615XX0007\n").unwrap();
        assert_eq!(scanner.get_reading(false).await.unwrap(), NG);
        assert_eq!(scanner.get_reading(true).await.unwrap(), "240615XX0007A");
        assert!(camera.join("cam_240615XX0007_1.bmp").exists());
    }
}
