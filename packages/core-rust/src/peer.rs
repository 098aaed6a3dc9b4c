//! Peer classification and authenticated identities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Bit mask of roles a connected peer declared during the handshake.
///
/// A peer may carry several roles at once. [`PeerRoles::MONITOR`] marks
/// another node of this same service; requests from such peers are
/// routed and trusted differently from external clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerRoles(u32);

impl PeerRoles {
    pub const NONE: PeerRoles = PeerRoles(0);
    /// Internal peer: another monitor of the same cluster.
    pub const MONITOR: PeerRoles = PeerRoles(0x01);
    pub const METADATA: PeerRoles = PeerRoles(0x02);
    pub const STORAGE: PeerRoles = PeerRoles(0x04);
    pub const CLIENT: PeerRoles = PeerRoles(0x08);
    pub const MANAGER: PeerRoles = PeerRoles(0x10);

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        PeerRoles(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: PeerRoles) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: PeerRoles) -> Self {
        PeerRoles(self.0 | other.0)
    }

    #[must_use]
    pub const fn is_internal_peer(self) -> bool {
        self.contains(Self::MONITOR)
    }
}

impl std::ops::BitOr for PeerRoles {
    type Output = PeerRoles;

    fn bitor(self, rhs: PeerRoles) -> PeerRoles {
        self.union(rhs)
    }
}

impl fmt::Display for PeerRoles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PeerRoles, &str); 5] = [
            (PeerRoles::MONITOR, "mon"),
            (PeerRoles::METADATA, "mds"),
            (PeerRoles::STORAGE, "osd"),
            (PeerRoles::CLIENT, "client"),
            (PeerRoles::MANAGER, "mgr"),
        ];
        let mut first = true;
        for (role, name) in NAMES {
            if self.contains(role) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Authenticated identity attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Unique identifier for the authenticated entity.
    pub id: String,
    /// Roles assigned to this principal for authorization checks.
    pub roles: Vec<String>,
}
