//! Entity replication for netrep.
//!
//! One [`EntityReplicationManager`] serves one connection. A
//! [`ReplicationWindow`] decides which entities the remote sees and at what
//! priority; the manager keeps an [`EntityReplicator`] per visible entity,
//! publishes changed properties, and applies the remote's updates through
//! each replicator's [`PropertySubscriber`].
//!
//! [`NetworkInputHistory`] holds a controlling client's unacknowledged
//! inputs for prediction and correction.
//!
//! # Design Principles
//!
//! - **Caller-driven time** - Every operation takes the current time; nothing
//!   reads a clock for protocol decisions.
//! - **Newest wins** - Each subscriber applies packets only in strictly
//!   increasing id order.
//! - **Untrusted input** - Remote messages are validated against the
//!   connection's mode before they touch entity state.
//! - **Engine-agnostic** - Entities are reached through [`EntityWorld`] and
//!   [`NetBindComponent`].

mod component;
mod config;
mod error;
mod input_history;
mod manager;
mod publisher;
mod replicator;
mod role;
mod set;
mod subscriber;
mod types;
mod value;
mod window;
mod world;

pub use component::{DirtyMask, NetBindComponent, PropertyChange, ReplicatedEntity};
pub use config::{ReplicationConfig, REPLICATION_OVERHEAD_BYTES, TRANSPORT_HEADER_BYTES};
pub use error::{PropertyError, ReplicationError, ReplicationResult};
pub use input_history::{ClientInputId, HostFrameId, NetworkInput, NetworkInputHistory};
pub use manager::{
    EntityReplicationManager, PacketSender, SendStats, UpdateMode, UpdateValidation,
    UNREPORTED_PACKET_WINDOW,
};
pub use publisher::{PreparedUpdate, PropertyPublisher};
pub use replicator::{EntityReplicator, OutboundUpdate};
pub use role::NetEntityRole;
pub use set::{EntityReplicationData, ReplicationSet};
pub use subscriber::{ChangeOutcome, PropertySubscriber};
pub use types::{EntityRegistry, NetEntityHandle, TimeMs};
pub use value::PropertyValue;
pub use window::{NullReplicationWindow, ReplicationWindow};
pub use world::{EntityWorld, LocalWorld};
