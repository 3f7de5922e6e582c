//! Configurable limits for bounded decoding.

/// Wire-level limits for packet decoding.
///
/// These limits are enforced during decoding to prevent resource exhaustion
/// and ensure bounded memory usage. Property payloads inside a message are
/// bounded here only by length; their contents belong to higher layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum packet size in bytes.
    pub max_packet_bytes: usize,

    /// Maximum number of messages (or reset ids) in a packet.
    pub max_messages: usize,

    /// Maximum length of a single message's property data in bytes.
    pub max_message_data_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            // Oversized single entities may exceed one MTU, so leave room.
            max_packet_bytes: 64 * 1024,
            max_messages: 2048,
            max_message_data_len: 32 * 1024,
        }
    }
}

impl Limits {
    /// Creates limits suitable for testing with smaller values.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            max_packet_bytes: 4096,
            max_messages: 64,
            max_message_data_len: 1024,
        }
    }

    /// Creates limits with no restrictions (use with caution).
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            max_packet_bytes: usize::MAX,
            max_messages: usize::MAX,
            max_message_data_len: usize::MAX,
        }
    }
}
