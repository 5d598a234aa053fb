use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("backing file unavailable")]
    StoreUnavailable(#[source] io::Error),
    #[error("failed to map {size} bytes at offset {offset}")]
    MappingFailed {
        offset: u64,
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("element size must be 1, 2, 4 or 8, got {0}")]
    InvalidElementSize(usize),
    #[error("scanner is not attached to a process")]
    NotAttached,
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::StoreUnavailable(error)
    }
}
