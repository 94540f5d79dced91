//! # Tether Wire
//!
//! The byte-level contract shared by both ends of a channel.
//!
//! ## Architecture
//!
//! - **Frames**: every command travels as one length-prefixed frame
//!   (4-byte big-endian length, then the postcard-encoded body).
//! - **Preamble**: the first frame in each direction announces the sender's
//!   capabilities. Both ends settle on the intersection before any command
//!   flows, and the result never changes for the lifetime of the channel.
//! - **Payloads**: user call payloads are wrapped in one of two envelopes,
//!   selected by the negotiated capabilities.

pub mod capability;
pub mod codec;
pub mod error;
pub mod frame;

pub use capability::negotiate;
pub use capability::Capability;
pub use capability::Preamble;
pub use capability::PROTOCOL_VERSION;
pub use codec::decode_payload;
pub use codec::encode_payload;
pub use codec::from_bytes;
pub use codec::to_bytes;
pub use codec::Encoding;
pub use codec::Payload;
pub use error::Error;
pub use error::Result;
pub use frame::read_frame;
pub use frame::write_frame;
pub use frame::frame_limit;
pub use frame::DEFAULT_MAX_FRAME_LEN;
