use crate::data_path;

use std::fs;
use std::path::PathBuf;

pub const CURRENT_LOG: &str = "insight-current.log";
pub const PREVIOUS_LOG: &str = "insight-previous.log";

pub fn path() -> Result<PathBuf, Error> {
    let full_path = data_path(Some(CURRENT_LOG));

    let parent = full_path.parent().ok_or(Error::InvalidPath)?;
    if !parent.exists() {
        fs::create_dir_all(parent)?;
    }

    Ok(full_path)
}

/// Opens a fresh log file, keeping the previous run's log next to it.
pub fn file() -> Result<fs::File, Error> {
    let path = path()?;

    if path.exists() {
        fs::rename(&path, path.with_file_name(PREVIOUS_LOG))?;
    }

    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;

    Ok(file)
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Log path has no parent directory")]
    InvalidPath,
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
