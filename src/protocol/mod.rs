//! Protocol module for PostgreSQL logical replication protocol handling
//!
//! Byte-level reading, COPY-both frame types and the pgoutput message
//! decoder.

pub mod buffer;
pub mod cursor;
pub mod decoder;
pub mod messages;

#[cfg(test)]
pub(crate) mod fixtures;

// Re-export for convenience
pub use buffer::BufferWriter;
pub use cursor::{ByteSource, Cursor, HexText, RawBytes};
pub use decoder::MessageDecoder;
pub use messages::*;
