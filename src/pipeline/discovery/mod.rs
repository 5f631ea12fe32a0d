pub mod category;
pub mod ignore;
pub mod scanner;

pub use category::*;
pub use ignore::*;
pub use scanner::*;

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::resilience::{Classify, ErrorKind};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Scan root not found: {0}")]
    NotFound(PathBuf),

    #[error("Scan root is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for DiscoveryError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::NotADirectory(_) => ErrorKind::InvalidInput,
            Self::Io(_) => ErrorKind::Storage,
        }
    }
}
