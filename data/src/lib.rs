pub mod config;
pub mod history;
pub mod log;
pub mod timeline;
pub mod util;

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

pub use config::Config;
pub use history::HistoryBuffer;
pub use timeline::MergedTimeline;

use ::log::{info, warn};
use serde::de::DeserializeOwned;

#[derive(thiserror::Error, Debug)]
pub enum InternalError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl InternalError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, InternalError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

pub fn write_json_to_file(json: &str, file_name: &str) -> std::io::Result<()> {
    let path = data_path(Some(file_name));

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "Invalid state file path")
    })?;

    if !parent.exists() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

pub fn read_from_file<T: DeserializeOwned>(file_name: &str) -> Result<T, InternalError> {
    let path = data_path(Some(file_name));

    let mut file = File::open(&path)?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    match serde_json::from_str(&contents) {
        Ok(value) => Ok(value),
        Err(e) => {
            // If parsing fails, backup the file
            drop(file); // Close the file before renaming

            let backup_path = data_path(Some(&backup_file_name(file_name)));

            if let Err(rename_err) = std::fs::rename(&path, &backup_path) {
                warn!(
                    "Failed to backup corrupted file '{}' to '{}': {}",
                    path.display(),
                    backup_path.display(),
                    rename_err
                );
            } else {
                info!(
                    "Backed up corrupted file to '{}'. It can be restored manually.",
                    backup_path.display()
                );
            }

            Err(InternalError::Json(e))
        }
    }
}

fn backup_file_name(file_name: &str) -> String {
    // different name so the backup is never overwritten by the next save
    if let Some(pos) = file_name.rfind('.') {
        format!("{}_old{}", &file_name[..pos], &file_name[pos..])
    } else {
        format!("{}_old", file_name)
    }
}

pub fn data_path(path_name: Option<&str>) -> PathBuf {
    let base = if let Ok(path) = std::env::var("INSIGHT_DATA_PATH") {
        PathBuf::from(path)
    } else {
        let data_dir = dirs_next::data_dir().unwrap_or_else(|| PathBuf::from("."));
        data_dir.join("insight")
    };

    match path_name {
        Some(path_name) => base.join(path_name),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_names_keep_extension() {
        assert_eq!(backup_file_name("config.json"), "config_old.json");
        assert_eq!(backup_file_name("config"), "config_old");
    }
}
