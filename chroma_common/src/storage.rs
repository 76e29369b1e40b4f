//! On-disk persistence for programs and name tables.
//!
//! Everything here degrades gracefully: a missing or corrupt file yields
//! an empty program or default names, a warning in the log, and boot
//! continues. Save failures are reported to the caller.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::config::StorageConfig;
use crate::consts::{COLUMN_NAMES_FILE, PROGRAM_FILE, REAGENT_NAMES_FILE};
use crate::program::{NameTable, Program};

/// Error type for persistence operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolved persistence paths.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub program: PathBuf,
    pub reagent_names: PathBuf,
    pub column_names: PathBuf,
}

impl StoragePaths {
    pub fn from_config(config: &StorageConfig) -> Self {
        let dir = Path::new(&config.data_dir);
        Self {
            program: dir.join(PROGRAM_FILE),
            reagent_names: dir.join(REAGENT_NAMES_FILE),
            column_names: dir.join(COLUMN_NAMES_FILE),
        }
    }
}

/// Load the persisted program, or an empty one when the file is missing
/// or invalid.
pub fn load_program(path: &Path) -> Program {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("no program file at {}; starting empty", path.display());
            return Program::new();
        }
        Err(e) => {
            warn!("failed to read program file {}: {e}", path.display());
            return Program::new();
        }
    };
    match Program::from_file_image(&bytes) {
        Some(program) => {
            info!("loaded program with {} steps", program.len());
            program
        }
        None => {
            warn!(
                "program file {} is invalid; starting empty",
                path.display()
            );
            Program::new()
        }
    }
}

/// Persist the program as `u16` LE length + raw step bytes.
pub fn save_program(path: &Path, program: &Program) -> Result<(), StorageError> {
    write_file(path, &program.to_file_image())?;
    info!("saved program with {} steps", program.len());
    Ok(())
}

/// Load a persisted name table, or defaults built from `prefix`.
pub fn load_names(path: &Path, prefix: &str) -> NameTable {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to read name file {}: {e}", path.display());
            }
            return NameTable::with_prefix(prefix);
        }
    };
    match NameTable::from_bytes(&bytes) {
        Some(table) => table,
        None => {
            warn!(
                "name file {} is truncated; using defaults",
                path.display()
            );
            NameTable::with_prefix(prefix)
        }
    }
}

/// Persist a name table as raw bytes.
pub fn save_names(path: &Path, table: &NameTable) -> Result<(), StorageError> {
    write_file(path, &table.to_bytes())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, bytes).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })
}
