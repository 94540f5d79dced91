//! # Payload Codec
//!
//! Values are encoded with postcard. User call payloads additionally carry
//! a reference to the callable type so the receiver can pick the right
//! decoder.
//!
//! ## Encodings
//! - **Simple**: only the type tag travels. Both ends are assumed to share
//!   one set of definitions, and the receiver resolves the tag in the module
//!   named by the request.
//! - **MultiContext**: the type tag is qualified with the module it belongs
//!   to, so it resolves against the correct one of several active modules.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;

/// Payload encoding negotiated for a channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Encoding {
    Simple,
    MultiContext,
}

/// Encodes any serializable value.
pub fn to_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decodes a value previously produced by [`to_bytes`].
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

/// A decoded user call payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    /// Module the type tag is qualified with. Always `None` under `Simple`;
    /// `None` under `MultiContext` means the receiver's default module.
    pub module: Option<String>,
    pub tag: String,
    pub body: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SimpleEnvelope {
    tag: String,
    body: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct QualifiedEnvelope {
    module: Option<String>,
    tag: String,
    body: Vec<u8>,
}

/// Wraps an encoded callable body in the envelope for `encoding`.
pub fn encode_payload(encoding: Encoding, module: Option<&str>, tag: &str, body: Vec<u8>) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Simple => to_bytes(&SimpleEnvelope { tag: tag.to_string(), body }),
        Encoding::MultiContext => to_bytes(&QualifiedEnvelope {
            module: module.map(str::to_string),
            tag: tag.to_string(),
            body,
        }),
    }
}

/// Unwraps a payload produced by [`encode_payload`] with the same encoding.
pub fn decode_payload(encoding: Encoding, bytes: &[u8]) -> Result<Payload> {
    match encoding {
        Encoding::Simple => {
            let env: SimpleEnvelope = from_bytes(bytes)?;
            Ok(Payload { module: None, tag: env.tag, body: env.body })
        }
        Encoding::MultiContext => {
            let env: QualifiedEnvelope = from_bytes(bytes)?;
            Ok(Payload { module: env.module, tag: env.tag, body: env.body })
        }
    }
}
