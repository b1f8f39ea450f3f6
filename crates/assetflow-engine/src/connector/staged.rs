//! Writer that stages into a temporary file next to its destination and
//! renames on commit.

use std::io::{self, Write};
use std::path::PathBuf;

use assetflow_types::error::ConnectorError;
use tempfile::NamedTempFile;

use super::TargetWriter;

#[derive(Debug)]
pub struct StagedFileWriter {
    staging: NamedTempFile,
    destination: PathBuf,
    written: u64,
}

impl StagedFileWriter {
    /// Create the destination's parent directories and a staging file in
    /// the same directory, so the final rename stays on one filesystem.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] if the directory or staging file cannot
    /// be created.
    pub fn create(destination: PathBuf) -> Result<Self, ConnectorError> {
        let parent = destination.parent().ok_or_else(|| {
            ConnectorError::config(
                "INVALID_TARGET",
                format!("target '{}' has no parent directory", destination.display()),
            )
        })?;
        std::fs::create_dir_all(parent).map_err(|e| ConnectorError::from_io("CREATE_DIR", &e))?;
        let staging = NamedTempFile::new_in(parent)
            .map_err(|e| ConnectorError::from_io("STAGING_FILE", &e))?;
        Ok(Self {
            staging,
            destination,
            written: 0,
        })
    }
}

impl Write for StagedFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.staging.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.staging.flush()
    }
}

impl TargetWriter for StagedFileWriter {
    fn commit(mut self: Box<Self>) -> Result<u64, ConnectorError> {
        self.staging
            .as_file_mut()
            .sync_all()
            .map_err(|e| ConnectorError::from_io("SYNC_FAILED", &e))?;
        let written = self.written;
        let Self {
            staging,
            destination,
            ..
        } = *self;
        staging
            .persist(&destination)
            .map_err(|e| ConnectorError::from_io("COMMIT_FAILED", &e.error))?;
        Ok(written)
    }

    fn abort(self: Box<Self>) {
        // Dropping the staging file removes it.
        drop(self);
    }
}
