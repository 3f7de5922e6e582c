//! Transport-assigned packet identifiers.

use std::fmt;

/// Identifier the transport assigns to every outbound packet.
///
/// Ids are totally ordered and increase per connection. [`PacketId::INVALID`]
/// is reserved as the "nothing received yet" sentinel and is never assigned
/// to a real packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PacketId(u32);

impl PacketId {
    /// Sentinel that precedes every real packet.
    pub const INVALID: Self = Self(0);

    /// First id a fresh connection assigns.
    pub const FIRST: Self = Self(1);

    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Returns the id after this one, skipping [`PacketId::INVALID`] on wrap.
    ///
    /// Comparison is plain numeric order, so once ids wrap every later id
    /// looks older than the ones already received. A connection has to be
    /// re-established before it sends `u32::MAX` packets.
    #[must_use]
    pub const fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Self::FIRST,
            raw => Self(raw),
        }
    }
}

impl From<u32> for PacketId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_precedes_everything() {
        assert!(PacketId::INVALID < PacketId::FIRST);
        assert!(PacketId::INVALID < PacketId::new(u32::MAX));
        assert!(!PacketId::INVALID.is_valid());
        assert_eq!(PacketId::default(), PacketId::INVALID);
    }

    #[test]
    fn next_increments() {
        assert_eq!(PacketId::new(41).next(), PacketId::new(42));
        assert_eq!(PacketId::INVALID.next(), PacketId::FIRST);
    }

    #[test]
    fn next_skips_invalid_on_wrap() {
        assert_eq!(PacketId::new(u32::MAX).next(), PacketId::FIRST);
    }

    #[test]
    fn display_and_from() {
        let id: PacketId = 7.into();
        assert_eq!(id.raw(), 7);
        assert_eq!(id.to_string(), "#7");
    }
}
