//! Compressed payload envelope.
//!
//! Used for `upload_state.stateData` on the wire and for snapshot blobs in
//! storage. On the JSON wire the byte payload travels as base64 text; in
//! SQLite it is stored as a raw BLOB next to the method tag.

use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    None,
    Lz4,
}

impl CompressionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionMethod::None => "none",
            CompressionMethod::Lz4 => "lz4",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(CompressionMethod::None),
            "lz4" => Some(CompressionMethod::Lz4),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{method, data}` wrapper around an opaque byte payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedBlob {
    pub method: CompressionMethod,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        BASE64.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
