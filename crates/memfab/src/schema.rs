// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Canonical type descriptions and schema hashing.
//!
//! Producers and consumers agree on the shape of slot payloads and the
//! flexible zone through a [`Schema`]: an ordered list of named fields with
//! fixed-width kinds. Two things derive from it:
//!
//! - A BLAKE2b-256 **schema hash** over the canonical textual description
//!   (`name:kind[count];` per field). The hash is stored in the segment
//!   header at creation and checked at attach, so layout drift between
//!   builds is caught before any payload is interpreted.
//! - **Field offsets**: fields are packed sequentially in declaration
//!   order, no padding. Offsets are derived, never user-supplied; the
//!   access API takes a field index and returns a byte span.

use crate::error::{FabricError, Result};
use crate::hashing::{self, DIGEST_SIZE};

/// Fixed-width field kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    /// Raw bytes; `count` is the length.
    Bytes,
}

impl FieldKind {
    /// Canonical type token used in the hashed description.
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::U64 => "u64",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Bytes => "bytes",
        }
    }

    /// Size of one element in bytes.
    #[must_use]
    pub fn elem_size(self) -> usize {
        match self {
            Self::U8 | Self::I8 | Self::Bytes => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }
}

/// One named field: kind plus element count (1 for scalars).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    pub name: String,
    pub kind: FieldKind,
    pub count: u32,
}

impl SchemaField {
    /// Scalar field.
    #[must_use]
    pub fn scalar(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            count: 1,
        }
    }

    /// Array field with `count` elements.
    #[must_use]
    pub fn array(name: &str, kind: FieldKind, count: u32) -> Self {
        Self {
            name: name.to_string(),
            kind,
            count,
        }
    }

    /// Total field size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.kind.elem_size() * self.count as usize
    }
}

/// Ordered, named field list describing a user type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    name: String,
    fields: Vec<SchemaField>,
}

impl Schema {
    /// Build a schema. Fails on an empty field list, a zero-count field, or
    /// duplicate field names.
    pub fn new(name: &str, fields: Vec<SchemaField>) -> Result<Self> {
        if fields.is_empty() {
            return Err(FabricError::ConfigInvalid(format!(
                "schema '{name}' has no fields"
            )));
        }
        for field in &fields {
            if field.count == 0 {
                return Err(FabricError::ConfigInvalid(format!(
                    "schema '{name}' field '{}' has zero count",
                    field.name
                )));
            }
        }
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(FabricError::ConfigInvalid(format!(
                    "schema '{name}' has duplicate field '{}'",
                    field.name
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            fields,
        })
    }

    /// Type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of fields.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Field by index.
    #[must_use]
    pub fn field(&self, idx: usize) -> Option<&SchemaField> {
        self.fields.get(idx)
    }

    /// Canonical textual description: `name{field:kind[count];...}`.
    ///
    /// This text, not struct bytes, is what gets hashed; the hash is
    /// therefore independent of compiler alignment decisions.
    #[must_use]
    pub fn canonical_text(&self) -> String {
        let mut out = String::with_capacity(32 + self.fields.len() * 16);
        out.push_str(&self.name);
        out.push('{');
        for field in &self.fields {
            out.push_str(&field.name);
            out.push(':');
            out.push_str(field.kind.token());
            out.push('[');
            out.push_str(&field.count.to_string());
            out.push_str("];");
        }
        out.push('}');
        out
    }

    /// BLAKE2b-256 of the canonical text.
    #[must_use]
    pub fn hash(&self) -> [u8; DIGEST_SIZE] {
        hashing::blake2b_256(self.canonical_text().as_bytes())
    }

    /// Byte offset of field `idx` in the packed layout.
    pub fn field_offset(&self, idx: usize) -> Result<usize> {
        if idx >= self.fields.len() {
            return Err(FabricError::ConfigInvalid(format!(
                "field index {idx} out of range for schema '{}' ({} fields)",
                self.name,
                self.fields.len()
            )));
        }
        Ok(self.fields[..idx].iter().map(SchemaField::size).sum())
    }

    /// Total packed size of the type in bytes.
    #[must_use]
    pub fn packed_size(&self) -> usize {
        self.fields.iter().map(SchemaField::size).sum()
    }

    /// Borrow the span of field `idx` out of a packed byte buffer.
    pub fn field_slice<'a>(&self, bytes: &'a [u8], idx: usize) -> Result<&'a [u8]> {
        let off = self.field_offset(idx)?;
        let len = self.fields[idx].size();
        bytes.get(off..off + len).ok_or_else(|| {
            FabricError::ConfigInvalid(format!(
                "buffer of {} bytes too small for schema '{}' (needs {})",
                bytes.len(),
                self.name,
                self.packed_size()
            ))
        })
    }

    /// Mutable variant of [`Schema::field_slice`].
    pub fn field_slice_mut<'a>(&self, bytes: &'a mut [u8], idx: usize) -> Result<&'a mut [u8]> {
        let off = self.field_offset(idx)?;
        let len = self.fields[idx].size();
        let total = bytes.len();
        bytes.get_mut(off..off + len).ok_or_else(|| {
            FabricError::ConfigInvalid(format!(
                "buffer of {total} bytes too small for schema '{}' (needs {})",
                self.name,
                self.packed_size()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry_schema() -> Schema {
        Schema::new(
            "Telemetry",
            vec![
                SchemaField::scalar("seq", FieldKind::U64),
                SchemaField::scalar("temp", FieldKind::F64),
                SchemaField::array("samples", FieldKind::U16, 8),
                SchemaField::array("tag", FieldKind::Bytes, 4),
            ],
        )
        .expect("valid schema")
    }

    #[test]
    fn test_canonical_text() {
        let s = telemetry_schema();
        assert_eq!(
            s.canonical_text(),
            "Telemetry{seq:u64[1];temp:f64[1];samples:u16[8];tag:bytes[4];}"
        );
    }

    #[test]
    fn test_hash_depends_on_every_component() {
        let base = telemetry_schema().hash();

        let renamed = Schema::new(
            "Telemetry2",
            vec![SchemaField::scalar("seq", FieldKind::U64)],
        )
        .unwrap();
        assert_ne!(base, renamed.hash());

        let retyped = Schema::new(
            "Telemetry",
            vec![
                SchemaField::scalar("seq", FieldKind::U32),
                SchemaField::scalar("temp", FieldKind::F64),
                SchemaField::array("samples", FieldKind::U16, 8),
                SchemaField::array("tag", FieldKind::Bytes, 4),
            ],
        )
        .unwrap();
        assert_ne!(base, retyped.hash());
    }

    #[test]
    fn test_offsets_packed() {
        let s = telemetry_schema();
        assert_eq!(s.field_offset(0).unwrap(), 0);
        assert_eq!(s.field_offset(1).unwrap(), 8);
        assert_eq!(s.field_offset(2).unwrap(), 16);
        assert_eq!(s.field_offset(3).unwrap(), 32);
        assert_eq!(s.packed_size(), 36);
    }

    #[test]
    fn test_field_slice_bounds() {
        let s = telemetry_schema();
        let buf = vec![0u8; s.packed_size()];
        assert_eq!(s.field_slice(&buf, 2).unwrap().len(), 16);
        assert!(s.field_slice(&buf, 4).is_err());

        let short = vec![0u8; 10];
        assert!(s.field_slice(&short, 3).is_err());
    }

    #[test]
    fn test_field_slice_mut_roundtrip() {
        let s = telemetry_schema();
        let mut buf = vec![0u8; s.packed_size()];
        s.field_slice_mut(&mut buf, 0)
            .unwrap()
            .copy_from_slice(&42u64.to_le_bytes());
        let got = u64::from_le_bytes(s.field_slice(&buf, 0).unwrap().try_into().unwrap());
        assert_eq!(got, 42);
    }

    #[test]
    fn test_invalid_schemas_rejected() {
        assert!(Schema::new("Empty", vec![]).is_err());
        assert!(Schema::new(
            "ZeroCount",
            vec![SchemaField::array("x", FieldKind::U8, 0)]
        )
        .is_err());
        assert!(Schema::new(
            "Dup",
            vec![
                SchemaField::scalar("x", FieldKind::U8),
                SchemaField::scalar("x", FieldKind::U16),
            ]
        )
        .is_err());
    }
}
