//! Bidirectional serializers.
//!
//! A single `serialize_properties`-style routine can be written once against
//! [`NetSerializer`] and driven in either direction: a [`WriteSerializer`]
//! reads from the `&mut` values and appends to its buffer, a
//! [`ReadSerializer`] overwrites the values from its input.
//!
//! Failure is sticky. After the first error every call returns that same
//! error without touching the buffer or the value, and
//! [`NetSerializer::is_valid`] reports `false`.

use std::fmt;

use crate::error::BitError;
use crate::reader::BitReader;
use crate::writer::BitWriter;

/// Result type for serializer operations.
pub type SerializeResult<T> = Result<T, SerializeError>;

/// Direction a serializer moves data in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializerMode {
    /// Values are written into the buffer.
    WriteToBuffer,
    /// Values are read out of the buffer.
    ReadFromBuffer,
}

/// A named field failed to serialize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializeError {
    /// Name passed with the failing call.
    pub field: &'static str,
    /// Underlying bitstream failure.
    pub source: BitError,
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to serialize '{}': {}", self.field, self.source)
    }
}

impl std::error::Error for SerializeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Serializer that reads or writes values depending on its mode.
///
/// Integer and varint calls are byte-aligned except [`serialize_bool`] and
/// [`serialize_bits`], which pack at bit granularity. Call [`align`] before
/// switching from packed bits to aligned values.
///
/// [`serialize_bool`]: NetSerializer::serialize_bool
/// [`serialize_bits`]: NetSerializer::serialize_bits
/// [`align`]: NetSerializer::align
pub trait NetSerializer {
    /// Direction of this serializer.
    fn mode(&self) -> SerializerMode;

    /// `false` once any call has failed.
    fn is_valid(&self) -> bool;

    fn serialize_bool(&mut self, value: &mut bool, name: &'static str) -> SerializeResult<()>;

    /// Packs the low `bits` bits of `value`.
    fn serialize_bits(
        &mut self,
        value: &mut u64,
        bits: u8,
        name: &'static str,
    ) -> SerializeResult<()>;

    fn serialize_u8(&mut self, value: &mut u8, name: &'static str) -> SerializeResult<()>;

    fn serialize_u16(&mut self, value: &mut u16, name: &'static str) -> SerializeResult<()>;

    fn serialize_u32(&mut self, value: &mut u32, name: &'static str) -> SerializeResult<()>;

    fn serialize_u64(&mut self, value: &mut u64, name: &'static str) -> SerializeResult<()>;

    fn serialize_varu32(&mut self, value: &mut u32, name: &'static str) -> SerializeResult<()>;

    fn serialize_vars32(&mut self, value: &mut i32, name: &'static str) -> SerializeResult<()>;

    fn serialize_varu64(&mut self, value: &mut u64, name: &'static str) -> SerializeResult<()>;

    /// Serializes an `f32` by its IEEE-754 bit pattern.
    fn serialize_f32(&mut self, value: &mut f32, name: &'static str) -> SerializeResult<()> {
        let mut bits = value.to_bits();
        self.serialize_u32(&mut bits, name)?;
        *value = f32::from_bits(bits);
        Ok(())
    }

    /// Moves to the next byte boundary.
    fn align(&mut self) -> SerializeResult<()>;

    /// Bits left unread in the input. Always 0 when writing.
    fn bits_remaining(&self) -> usize;
}

/// Serializer that appends values to a [`BitWriter`].
#[derive(Debug, Default)]
pub struct WriteSerializer {
    writer: BitWriter,
    failed: Option<SerializeError>,
}

impl WriteSerializer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            writer: BitWriter::with_capacity(bytes),
            failed: None,
        }
    }

    /// Returns the first error encountered, if any.
    pub const fn error(&self) -> Option<&SerializeError> {
        self.failed.as_ref()
    }

    /// Returns the encoded bytes, or the first error encountered.
    pub fn finish(self) -> SerializeResult<Vec<u8>> {
        match self.failed {
            Some(err) => Err(err),
            None => Ok(self.writer.finish()),
        }
    }

    fn run(
        &mut self,
        name: &'static str,
        op: impl FnOnce(&mut BitWriter) -> Result<(), BitError>,
    ) -> SerializeResult<()> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        op(&mut self.writer).map_err(|source| {
            let err = SerializeError {
                field: name,
                source,
            };
            self.failed = Some(err.clone());
            err
        })
    }
}

impl NetSerializer for WriteSerializer {
    fn mode(&self) -> SerializerMode {
        SerializerMode::WriteToBuffer
    }

    fn is_valid(&self) -> bool {
        self.failed.is_none()
    }

    fn serialize_bool(&mut self, value: &mut bool, name: &'static str) -> SerializeResult<()> {
        let value = *value;
        self.run(name, |w| {
            w.write_bit(value);
            Ok(())
        })
    }

    fn serialize_bits(
        &mut self,
        value: &mut u64,
        bits: u8,
        name: &'static str,
    ) -> SerializeResult<()> {
        let value = *value;
        self.run(name, |w| w.write_bits(value, bits))
    }

    fn serialize_u8(&mut self, value: &mut u8, name: &'static str) -> SerializeResult<()> {
        let value = *value;
        self.run(name, |w| w.write_u8_aligned(value))
    }

    fn serialize_u16(&mut self, value: &mut u16, name: &'static str) -> SerializeResult<()> {
        let value = *value;
        self.run(name, |w| w.write_u16_aligned(value))
    }

    fn serialize_u32(&mut self, value: &mut u32, name: &'static str) -> SerializeResult<()> {
        let value = *value;
        self.run(name, |w| w.write_u32_aligned(value))
    }

    fn serialize_u64(&mut self, value: &mut u64, name: &'static str) -> SerializeResult<()> {
        let value = *value;
        self.run(name, |w| w.write_u64_aligned(value))
    }

    fn serialize_varu32(&mut self, value: &mut u32, name: &'static str) -> SerializeResult<()> {
        let value = *value;
        self.run(name, |w| w.write_varu32(value))
    }

    fn serialize_vars32(&mut self, value: &mut i32, name: &'static str) -> SerializeResult<()> {
        let value = *value;
        self.run(name, |w| w.write_vars32(value))
    }

    fn serialize_varu64(&mut self, value: &mut u64, name: &'static str) -> SerializeResult<()> {
        let value = *value;
        self.run(name, |w| w.write_varu64(value))
    }

    fn align(&mut self) -> SerializeResult<()> {
        self.run("<align>", |w| {
            w.align_to_byte();
            Ok(())
        })
    }

    fn bits_remaining(&self) -> usize {
        0
    }
}

/// Serializer that fills values from a [`BitReader`].
#[derive(Debug)]
pub struct ReadSerializer<'a> {
    reader: BitReader<'a>,
    failed: Option<SerializeError>,
}

impl<'a> ReadSerializer<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self {
            reader: BitReader::new(data),
            failed: None,
        }
    }

    /// Returns the first error encountered, if any.
    pub const fn error(&self) -> Option<&SerializeError> {
        self.failed.as_ref()
    }

    fn run<T>(
        &mut self,
        name: &'static str,
        op: impl FnOnce(&mut BitReader<'a>) -> Result<T, BitError>,
    ) -> SerializeResult<T> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        op(&mut self.reader).map_err(|source| {
            let err = SerializeError {
                field: name,
                source,
            };
            self.failed = Some(err.clone());
            err
        })
    }
}

impl NetSerializer for ReadSerializer<'_> {
    fn mode(&self) -> SerializerMode {
        SerializerMode::ReadFromBuffer
    }

    fn is_valid(&self) -> bool {
        self.failed.is_none()
    }

    fn serialize_bool(&mut self, value: &mut bool, name: &'static str) -> SerializeResult<()> {
        *value = self.run(name, BitReader::read_bit)?;
        Ok(())
    }

    fn serialize_bits(
        &mut self,
        value: &mut u64,
        bits: u8,
        name: &'static str,
    ) -> SerializeResult<()> {
        *value = self.run(name, |r| r.read_bits(bits))?;
        Ok(())
    }

    fn serialize_u8(&mut self, value: &mut u8, name: &'static str) -> SerializeResult<()> {
        *value = self.run(name, BitReader::read_u8_aligned)?;
        Ok(())
    }

    fn serialize_u16(&mut self, value: &mut u16, name: &'static str) -> SerializeResult<()> {
        *value = self.run(name, BitReader::read_u16_aligned)?;
        Ok(())
    }

    fn serialize_u32(&mut self, value: &mut u32, name: &'static str) -> SerializeResult<()> {
        *value = self.run(name, BitReader::read_u32_aligned)?;
        Ok(())
    }

    fn serialize_u64(&mut self, value: &mut u64, name: &'static str) -> SerializeResult<()> {
        *value = self.run(name, BitReader::read_u64_aligned)?;
        Ok(())
    }

    fn serialize_varu32(&mut self, value: &mut u32, name: &'static str) -> SerializeResult<()> {
        *value = self.run(name, BitReader::read_varu32)?;
        Ok(())
    }

    fn serialize_vars32(&mut self, value: &mut i32, name: &'static str) -> SerializeResult<()> {
        *value = self.run(name, BitReader::read_vars32)?;
        Ok(())
    }

    fn serialize_varu64(&mut self, value: &mut u64, name: &'static str) -> SerializeResult<()> {
        *value = self.run(name, BitReader::read_varu64)?;
        Ok(())
    }

    fn align(&mut self) -> SerializeResult<()> {
        self.run("<align>", BitReader::align_to_byte)
    }

    fn bits_remaining(&self) -> usize {
        self.reader.bits_remaining()
    }
}
