//! Result formats: how step results are written to and read from a directory.

use crate::error::TangoError;
use std::path::{Path, PathBuf};

/// JSON result format. Writes a single `data.json` per result directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

impl JsonFormat {
    pub const FILE_NAME: &'static str = "data.json";

    pub fn write(&self, value: &serde_json::Value, dir: &Path) -> Result<PathBuf, TangoError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        let tmp = dir.join(format!("{}.tmp", Self::FILE_NAME));
        std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Read a result back. `None` when the directory holds no result.
    pub fn read(&self, dir: &Path) -> Result<Option<serde_json::Value>, TangoError> {
        let path = dir.join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}
