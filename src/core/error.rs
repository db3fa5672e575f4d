use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModguardError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Descriptor error in {path}: {message}")]
    DescriptorError { path: String, message: String },
    #[error("Unresolved module '{module}' referenced from {unit}")]
    UnresolvedModule { module: String, unit: String },
    #[error("Contract '{0}' is already bound")]
    DuplicateBinding(String),
    #[error("Contract '{0}' has no binding")]
    UnboundContract(String),
    #[error("Unbound contracts at startup: {}", .0.join(", "))]
    UnboundContracts(Vec<String>),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}
