//! Byte encodings shared across the storage layer: length varints and
//! order-preserving key encoding.

pub mod key;
pub mod varint;

pub use key::{decode_id, encode_id};
pub use varint::{decode_varint, encode_varint, varint_len};
