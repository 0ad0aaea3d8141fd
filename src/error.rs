//! Crate-wide error type

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Access past the end of the persistent image
    #[error("storage access out of bounds: offset {offset}, len {len}, capacity {capacity}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    /// The flash backend refused a read or write
    #[error("storage backend failure: {0}")]
    Backend(String),

    /// Marker or length of a persisted record is invalid
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("failed to encode message: {0}")]
    Encode(postcard::Error),

    #[error("failed to decode message: {0}")]
    Decode(postcard::Error),

    /// Serialized record does not fit its reserved region
    #[error("record of {len} bytes exceeds region of {region} bytes")]
    RecordTooLarge { len: usize, region: usize },

    #[error("{kind} table is full")]
    TableFull { kind: &'static str },

    #[error("no {kind} module with id {id}")]
    UnknownModule { kind: &'static str, id: u8 },
}

pub type Result<T> = core::result::Result<T, Error>;
