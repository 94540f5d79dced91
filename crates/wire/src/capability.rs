//! # Capability Negotiation
//!
//! Each end opens the channel by sending a `Preamble` frame. The negotiated
//! capability set is the intersection of both announcements, so a feature is
//! only used when both ends understand it.

use serde::Deserialize;
use serde::Serialize;

use crate::codec::Encoding;
use crate::error::Error;
use crate::error::Result;

/// Magic bytes opening every preamble.
pub const MAGIC: [u8; 4] = *b"TTHR";

/// Version of the command protocol spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// A set of optional protocol features, packed into a bitmap.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability(u64);

impl Capability {
    /// No optional features.
    pub const NONE: Capability = Capability(0);

    /// Payloads tag each type reference with the module it resolves in.
    pub const MULTI_CONTEXT: Capability = Capability(1 << 0);

    /// Every feature this crate implements.
    pub const ALL: Capability = Capability::MULTI_CONTEXT;

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Builds a set from raw bits, dropping bits this crate does not know.
    pub const fn from_bits_truncate(bits: u64) -> Self {
        Capability(bits & Self::ALL.0)
    }

    pub const fn contains(self, other: Capability) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Capability) -> Self {
        Capability(self.0 | other.0)
    }

    pub const fn intersection(self, other: Capability) -> Self {
        Capability(self.0 & other.0)
    }

    pub const fn supports_multi_context(self) -> bool {
        self.contains(Self::MULTI_CONTEXT)
    }

    /// The payload encoding implied by this capability set.
    pub const fn encoding(self) -> Encoding {
        if self.supports_multi_context() {
            Encoding::MultiContext
        } else {
            Encoding::Simple
        }
    }
}

impl std::ops::BitOr for Capability {
    type Output = Capability;

    fn bitor(self, rhs: Capability) -> Capability {
        self.union(rhs)
    }
}

/// Settles on the features both ends support.
pub fn negotiate(local: Capability, remote: Capability) -> Capability {
    local.intersection(remote)
}

/// The first frame sent in each direction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preamble {
    magic: [u8; 4],
    pub version: u16,
    pub capabilities: Capability,
}

impl Preamble {
    pub fn new(capabilities: Capability) -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            capabilities,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        crate::codec::to_bytes(self)
    }

    /// Decodes and validates a peer's preamble.
    ///
    /// Unknown capability bits are dropped rather than rejected, so a newer
    /// peer can still talk to us with the features we share.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let preamble: Preamble = crate::codec::from_bytes(bytes)
            .map_err(|e| Error::BadPreamble(e.to_string()))?;

        if preamble.magic != MAGIC {
            tracing::warn!(magic = ?preamble.magic, "rejecting preamble with unexpected magic");
            return Err(Error::BadPreamble(format!("unexpected magic {:?}", preamble.magic)));
        }
        if preamble.version != PROTOCOL_VERSION {
            tracing::warn!(version = preamble.version, ours = PROTOCOL_VERSION, "rejecting preamble version");
            return Err(Error::UnsupportedVersion(preamble.version));
        }

        let capabilities = Capability::from_bits_truncate(preamble.capabilities.bits());
        if capabilities != preamble.capabilities {
            tracing::debug!(
                offered = preamble.capabilities.bits(),
                known = capabilities.bits(),
                "ignoring unknown capability bits"
            );
        }

        Ok(Self { capabilities, ..preamble })
    }
}
