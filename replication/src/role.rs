//! Net entity roles.

use std::fmt;

/// The relationship a host has with a networked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NetEntityRole {
    /// Not yet computed. Never stored in a replication set.
    #[default]
    InvalidRole,
    /// This host owns the entity's state.
    Authority,
    /// A remote proxy that also controls the entity (a player's own pawn).
    AutonomousProxy,
    /// A remote proxy that only observes.
    SimulatedProxy,
    /// A peer server observing the entity.
    Server,
}

impl NetEntityRole {
    #[must_use]
    pub const fn to_raw(self) -> u8 {
        match self {
            Self::InvalidRole => 0,
            Self::Authority => 1,
            Self::AutonomousProxy => 2,
            Self::SimulatedProxy => 3,
            Self::Server => 4,
        }
    }

    /// Parses a raw wire value. Unknown values are `None`.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::InvalidRole),
            1 => Some(Self::Authority),
            2 => Some(Self::AutonomousProxy),
            3 => Some(Self::SimulatedProxy),
            4 => Some(Self::Server),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        !matches!(self, Self::InvalidRole)
    }

    /// Roles that run a controller for the entity.
    #[must_use]
    pub const fn has_controller(self) -> bool {
        matches!(self, Self::Authority | Self::AutonomousProxy)
    }
}

impl fmt::Display for NetEntityRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidRole => "invalid",
            Self::Authority => "authority",
            Self::AutonomousProxy => "autonomous",
            Self::SimulatedProxy => "simulated",
            Self::Server => "server",
        };
        f.write_str(name)
    }
}
