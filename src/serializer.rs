//! Conversion between typed keys/values and stored bytes.
//!
//! A serializer must round-trip exactly: `decode(encode(v)) == v`.

use bytes::Bytes;

use crate::error::SerializerError;

/// Encodes values of type `T` into bytes and back.
pub trait Serializer<T>: Send + Sync {
    /// Append the encoding of `value` to `buf`.
    fn encode(&self, value: &T, buf: &mut Vec<u8>);

    fn decode(&self, bytes: &[u8]) -> Result<T, SerializerError>;
}

/// UTF-8 strings stored as their raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn encode(&self, value: &String, buf: &mut Vec<u8>) {
        buf.extend_from_slice(value.as_bytes());
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, SerializerError> {
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

/// Reference-counted byte buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl Serializer<Bytes> for BytesSerializer {
    fn encode(&self, value: &Bytes, buf: &mut Vec<u8>) {
        buf.extend_from_slice(value);
    }

    fn decode(&self, bytes: &[u8]) -> Result<Bytes, SerializerError> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// Plain byte vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct VecSerializer;

impl Serializer<Vec<u8>> for VecSerializer {
    fn encode(&self, value: &Vec<u8>, buf: &mut Vec<u8>) {
        buf.extend_from_slice(value);
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, SerializerError> {
        Ok(bytes.to_vec())
    }
}

/// Fixed-width little-endian `u64`.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Serializer;

impl Serializer<u64> for U64Serializer {
    fn encode(&self, value: &u64, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&value.to_le_bytes());
    }

    fn decode(&self, bytes: &[u8]) -> Result<u64, SerializerError> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| SerializerError::Length {
            expected: 8,
            actual: bytes.len(),
        })?;
        Ok(u64::from_le_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded<T, S: Serializer<T>>(serializer: &S, value: &T) -> Vec<u8> {
        let mut buf = Vec::new();
        serializer.encode(value, &mut buf);
        buf
    }

    #[test]
    fn test_string() {
        let value = "héllo".to_string();
        let bytes = encoded(&StringSerializer, &value);
        assert_eq!(bytes, "héllo".as_bytes());
        assert_eq!(StringSerializer.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        let err = StringSerializer.decode(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, SerializerError::InvalidUtf8(_)));
    }

    #[test]
    fn test_encode_appends() {
        let mut buf = b"prefix".to_vec();
        VecSerializer.encode(&b"-suffix".to_vec(), &mut buf);
        assert_eq!(buf, b"prefix-suffix");
    }

    #[test]
    fn test_bytes() {
        let value = Bytes::from_static(b"\x00\x01binary");
        let bytes = encoded(&BytesSerializer, &value);
        assert_eq!(BytesSerializer.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_u64() {
        let bytes = encoded(&U64Serializer, &0x0102_0304_0506_0708);
        assert_eq!(bytes, [8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(U64Serializer.decode(&bytes).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_u64_length_mismatch() {
        assert_eq!(
            U64Serializer.decode(&[1, 2, 3]).unwrap_err(),
            SerializerError::Length {
                expected: 8,
                actual: 3
            }
        );
    }
}
