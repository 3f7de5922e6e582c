//! Client input history for prediction and reconciliation.

use std::collections::vec_deque::{self, VecDeque};
use std::fmt;
use std::ops::{Index, IndexMut};

use crate::types::TimeMs;

/// Client-assigned input sequence number. Wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientInputId(u16);

impl ClientInputId {
    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Wrap-aware ordering: `true` if `self` is within half the id space
    /// after `other`.
    #[must_use]
    pub const fn is_newer_than(self, other: Self) -> bool {
        let diff = self.0.wrapping_sub(other.0);
        diff != 0 && diff < 0x8000
    }
}

impl fmt::Display for ClientInputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "input {}", self.0)
    }
}

/// Host simulation frame the input was generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HostFrameId(u32);

impl HostFrameId {
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// One input snapshot with the ids needed to line it up with server state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetworkInput<P> {
    pub client_input_id: ClientInputId,
    pub host_frame_id: HostFrameId,
    pub host_time: TimeMs,
    pub payload: P,
}

impl<P> NetworkInput<P> {
    #[must_use]
    pub const fn new(
        client_input_id: ClientInputId,
        host_frame_id: HostFrameId,
        host_time: TimeMs,
        payload: P,
    ) -> Self {
        Self {
            client_input_id,
            host_frame_id,
            host_time,
            payload,
        }
    }
}

/// Ordered inputs, oldest at index 0.
///
/// There is no implicit eviction: the owner pops from the front once the
/// server has processed an input. Indexing out of range and [`front`]
/// on an empty history are caller bugs and panic.
///
/// [`front`]: Self::front
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInputHistory<I> {
    inputs: VecDeque<I>,
}

impl<I> NetworkInputHistory<I> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inputs: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inputs: VecDeque::with_capacity(capacity),
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.inputs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn push_back(&mut self, input: I) {
        self.inputs.push_back(input);
    }

    /// Removes the oldest input. Popping an empty history asserts in debug
    /// builds and does nothing in release builds.
    pub fn pop_front(&mut self) -> Option<I> {
        debug_assert!(!self.inputs.is_empty(), "pop_front on empty input history");
        self.inputs.pop_front()
    }

    /// The oldest input.
    #[must_use]
    pub fn front(&self) -> &I {
        &self[0]
    }

    /// The newest input, if any.
    #[must_use]
    pub fn back(&self) -> Option<&I> {
        self.inputs.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> vec_deque::Iter<'_, I> {
        self.inputs.iter()
    }

    pub fn clear(&mut self) {
        self.inputs.clear();
    }
}

impl<I> Default for NetworkInputHistory<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> Index<usize> for NetworkInputHistory<I> {
    type Output = I;

    fn index(&self, index: usize) -> &I {
        match self.inputs.get(index) {
            Some(input) => input,
            None => panic!(
                "input history index {index} out of range (size {})",
                self.inputs.len()
            ),
        }
    }
}

impl<I> IndexMut<usize> for NetworkInputHistory<I> {
    fn index_mut(&mut self, index: usize) -> &mut I {
        let len = self.inputs.len();
        match self.inputs.get_mut(index) {
            Some(input) => input,
            None => panic!("input history index {index} out of range (size {len})"),
        }
    }
}

impl<'a, I> IntoIterator for &'a NetworkInputHistory<I> {
    type Item = &'a I;
    type IntoIter = vec_deque::Iter<'a, I>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
