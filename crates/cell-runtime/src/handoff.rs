//! Hand-off files read by the marking controller.
//!
//! Both files are overwritten every cycle and checked by reading them back.
//! The file work runs on the blocking pool.

use crate::blocking_fs;
use cell_common::config::FilesConfig;
use cell_common::{CellError, CellResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The code file (barcode text) and the text file (date-prefixed serial).
#[derive(Debug, Clone)]
pub struct HandoffFiles {
    code_file: PathBuf,
    text_file: PathBuf,
    write_retries: u32,
}

impl HandoffFiles {
    /// Create a writer; `write_retries` rewrites are attempted per file.
    #[must_use]
    pub fn new(code_file: impl Into<PathBuf>, text_file: impl Into<PathBuf>, write_retries: u32) -> Self {
        Self {
            code_file: code_file.into(),
            text_file: text_file.into(),
            write_retries,
        }
    }

    /// Writer for the `[files]` section.
    #[must_use]
    pub fn from_config(files: &FilesConfig, write_retries: u32) -> Self {
        Self::new(&files.code_file, &files.text_file, write_retries)
    }

    /// Path of the code file.
    #[must_use]
    pub fn code_file(&self) -> &Path {
        &self.code_file
    }

    /// Path of the text file.
    #[must_use]
    pub fn text_file(&self) -> &Path {
        &self.text_file
    }

    /// Overwrite both files and verify them.
    ///
    /// # Errors
    ///
    /// [`CellError::Io`] when a file cannot be written, or
    /// [`CellError::VerificationFailure`] when a read-back still differs after
    /// every rewrite.
    pub async fn write(&self, code: &str, text: &str) -> CellResult<()> {
        let files = self.clone();
        let (code, text) = (code.to_string(), text.to_string());
        blocking_fs(move || files.write_blocking(&code, &text)).await
    }

    /// Trimmed content of the code file.
    ///
    /// # Errors
    ///
    /// [`CellError::Io`] when the file cannot be read.
    pub async fn read_code(&self) -> CellResult<String> {
        let path = self.code_file.clone();
        blocking_fs(move || Ok(fs::read_to_string(path)?.trim().to_string())).await
    }

    fn write_blocking(&self, code: &str, text: &str) -> CellResult<()> {
        write_file(&self.code_file, code)?;
        write_file(&self.text_file, text)?;
        self.verify(&self.text_file, text)?;
        self.verify(&self.code_file, code)?;
        debug!(code, text, "Hand-off files written");
        Ok(())
    }

    fn verify(&self, path: &Path, expected: &str) -> CellResult<()> {
        for attempt in 0..=self.write_retries {
            if attempt > 0 {
                write_file(path, expected)?;
            }
            match fs::read_to_string(path) {
                Ok(actual) if actual == expected => return Ok(()),
                Ok(actual) => {
                    warn!(path = %path.display(), attempt, expected, actual = %actual, "Read-back mismatch");
                }
                Err(e) => warn!(path = %path.display(), attempt, error = %e, "Read-back failed"),
            }
        }
        Err(CellError::VerificationFailure {
            path: path.display().to_string(),
        })
    }
}

fn write_file(path: &Path, content: &str) -> CellResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}
