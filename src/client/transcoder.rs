//! Application value encoding
//!
//! Values travel as opaque bytes plus a 32-bit flags word. The top byte of
//! the flags carries the common format code shared by Couchbase SDKs.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::datatype;
use crate::utils::{KvError, Result};

const FORMAT_MASK: u32 = 0xff00_0000;
pub const FORMAT_JSON: u32 = 0x0200_0000;
pub const FORMAT_BINARY: u32 = 0x0300_0000;

/// Converts between application values and stored bytes
pub trait Transcoder {
    type Value;

    fn encode(&self, value: &Self::Value) -> Result<(Vec<u8>, u32)>;

    fn decode(&self, bytes: &[u8], flags: u32) -> Result<Self::Value>;

    /// Datatype bits to send with encoded values
    fn datatype(&self) -> u8 {
        datatype::RAW
    }
}

/// Bytes in, bytes out
#[derive(Debug, Clone, Copy, Default)]
pub struct RawTranscoder;

impl Transcoder for RawTranscoder {
    type Value = Vec<u8>;

    fn encode(&self, value: &Vec<u8>) -> Result<(Vec<u8>, u32)> {
        Ok((value.clone(), 0))
    }

    fn decode(&self, bytes: &[u8], _flags: u32) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// serde_json for any serializable type
pub struct JsonTranscoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonTranscoder<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for JsonTranscoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Transcoder for JsonTranscoder<T> {
    type Value = T;

    fn encode(&self, value: &T) -> Result<(Vec<u8>, u32)> {
        let bytes = serde_json::to_vec(value).map_err(|e| KvError::Transcode(e.to_string()))?;
        Ok((bytes, FORMAT_JSON))
    }

    fn decode(&self, bytes: &[u8], flags: u32) -> Result<T> {
        // legacy writers leave the format byte empty
        let format = flags & FORMAT_MASK;
        if format != 0 && format != FORMAT_JSON {
            return Err(KvError::Transcode(format!("flags 0x{:08x} do not describe JSON", flags)));
        }
        serde_json::from_slice(bytes).map_err(|e| KvError::Transcode(e.to_string()))
    }

    fn datatype(&self) -> u8 {
        datatype::JSON
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Airline {
        name: String,
        callsign: Option<String>,
    }

    #[test]
    fn test_json_sets_format_flags() {
        let t = JsonTranscoder::<Airline>::new();
        let value = Airline {
            name: "40-Mile Air".into(),
            callsign: Some("MILE-AIR".into()),
        };
        let (bytes, flags) = t.encode(&value).unwrap();
        assert_eq!(flags, FORMAT_JSON);
        assert_eq!(t.datatype(), datatype::JSON);
        assert_eq!(t.decode(&bytes, flags).unwrap(), value);
    }

    #[test]
    fn test_json_accepts_legacy_flags() {
        let t = JsonTranscoder::<serde_json::Value>::new();
        let v = t.decode(br#"{"a":1}"#, 0).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_json_rejects_binary_documents() {
        let t = JsonTranscoder::<serde_json::Value>::new();
        let err = t.decode(b"\x00\x01", FORMAT_BINARY).unwrap_err();
        assert!(matches!(err, KvError::Transcode(_)));
    }

    #[test]
    fn test_raw_passes_bytes_through() {
        let (bytes, flags) = RawTranscoder.encode(&vec![1, 2, 3]).unwrap();
        assert_eq!(flags, 0);
        assert_eq!(RawTranscoder.decode(&bytes, 7).unwrap(), vec![1, 2, 3]);
    }
}
