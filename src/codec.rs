//! Vector blob encoding for the embedded backend
//!
//! Vectors are stored as packed little-endian `f32` values, four bytes per component.
//! The networked backend uses the native pgvector column type instead.

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};

const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Encode a vector as a little-endian blob
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = vec![0u8; vector.len() * F32_BYTES];
    LittleEndian::write_f32_into(vector, &mut bytes);
    bytes
}

/// Decode a little-endian blob back into a vector
pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    let Some(dimension) = blob_dimension(bytes.len()) else {
        return Err(Error::Serialization(format!(
            "vector blob length {} is not a multiple of {}",
            bytes.len(),
            F32_BYTES
        )));
    };

    let mut vector = vec![0f32; dimension];
    LittleEndian::read_f32_into(bytes, &mut vector);
    Ok(vector)
}

/// Number of components a blob of `byte_len` bytes holds, if it is well-formed
pub fn blob_dimension(byte_len: usize) -> Option<usize> {
    (byte_len % F32_BYTES == 0).then_some(byte_len / F32_BYTES)
}
