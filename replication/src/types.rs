//! Core handle and time types.

use std::fmt;

/// Reuse-safe reference to a networked entity.
///
/// A handle is an arena slot index plus the slot's generation at the time the
/// entity was allocated. Once the slot is released and reused the generation
/// differs, so an old handle never aliases the new entity.
///
/// Handles are ordered and hashed by [`raw`](Self::raw), which is also the
/// net entity id carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetEntityHandle {
    index: u32,
    generation: u32,
}

impl NetEntityHandle {
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Reconstructs a handle from its raw bits.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }

    /// Returns `(generation << 32) | index`.
    #[must_use]
    pub const fn raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl PartialOrd for NetEntityHandle {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NetEntityHandle {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.raw().cmp(&other.raw())
    }
}

impl fmt::Display for NetEntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Host time in milliseconds.
///
/// The replication core never reads a clock for protocol decisions; callers
/// pass the current time in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeMs(u64);

impl TimeMs {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(ms: u64) -> Self {
        Self(ms)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn saturating_add(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

impl From<u64> for TimeMs {
    fn from(ms: u64) -> Self {
        Self(ms)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    generation: u32,
    alive: bool,
}

/// Arena that hands out reuse-safe [`NetEntityHandle`]s.
///
/// Authoritative hosts [`allocate`](Self::allocate) handles. Hosts that
/// receive entities from a remote authority [`adopt`](Self::adopt) the
/// handle the remote assigned, so both sides agree on the raw id.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl EntityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a handle, reusing a released slot if one is free.
    pub fn allocate(&mut self) -> NetEntityHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.alive = true;
            return NetEntityHandle::new(index, slot.generation);
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            alive: true,
        });
        NetEntityHandle::new(index, 0)
    }

    /// Marks a remotely assigned handle alive.
    ///
    /// Returns `false` if the slot currently holds a different live
    /// generation, or the same handle is already alive.
    pub fn adopt(&mut self, handle: NetEntityHandle) -> bool {
        let index = handle.index() as usize;
        if index >= self.slots.len() {
            self.slots.resize(
                index + 1,
                Slot {
                    generation: 0,
                    alive: false,
                },
            );
        }
        let slot = &mut self.slots[index];
        if slot.alive {
            return false;
        }
        slot.generation = handle.generation();
        slot.alive = true;
        self.free.retain(|free| *free != handle.index());
        true
    }

    /// Releases a live handle. The slot's generation is bumped so the
    /// released handle stays dead.
    pub fn release(&mut self, handle: NetEntityHandle) -> bool {
        if !self.is_alive(handle) {
            return false;
        }
        let slot = &mut self.slots[handle.index() as usize];
        slot.alive = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index());
        true
    }

    #[must_use]
    pub fn is_alive(&self, handle: NetEntityHandle) -> bool {
        self.slots
            .get(handle.index() as usize)
            .is_some_and(|slot| slot.alive && slot.generation == handle.generation())
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.alive).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
