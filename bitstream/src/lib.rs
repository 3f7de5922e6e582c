//! Bit packing primitives and bidirectional serializers for netrep.
//!
//! [`BitWriter`] and [`BitReader`] do the bit-level encoding and decoding.
//! [`NetSerializer`] wraps them behind one trait so replicated state can be
//! described by a single routine that both writes and reads.
//!
//! # Design Principles
//!
//! - **No unsafe code** - Safety is paramount.
//! - **Bounded operations** - All reads/writes are bounds-checked.
//! - **No domain knowledge** - This crate knows nothing about entities, roles, or packets.
//! - **Explicit errors** - All failures return structured errors, never panic.
//!
//! # Example
//!
//! ```
//! use bitstream::{NetSerializer, ReadSerializer, WriteSerializer};
//!
//! let mut health = 75u16;
//! let mut writer = WriteSerializer::new();
//! writer.serialize_u16(&mut health, "health").unwrap();
//! let bytes = writer.finish().unwrap();
//!
//! let mut decoded = 0u16;
//! let mut reader = ReadSerializer::new(&bytes);
//! reader.serialize_u16(&mut decoded, "health").unwrap();
//! assert_eq!(decoded, 75);
//! ```

mod error;
mod reader;
mod serializer;
mod writer;

pub use error::{BitError, BitResult};
pub use reader::BitReader;
pub use serializer::{
    NetSerializer, ReadSerializer, SerializeError, SerializeResult, SerializerMode,
    WriteSerializer,
};
pub use writer::BitWriter;
