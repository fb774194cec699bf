//! Introspection descriptors and value containers.
//!
//! PVAccess transfers strongly-typed structures: a server first describes a
//! type (a tree of scalars, scalar arrays and nested structures) and then
//! sends values, possibly masked by a [`BitSet`] naming which fields changed.
//! This module models that: [`FieldDesc`] is the type descriptor,
//! [`PvStructure`]/[`PvValue`] hold values, and [`IntrospectionRegistry`] is
//! the per-circuit cache that lets a peer send a two-byte reference instead
//! of a full descriptor once a type has been seen.
//!
//! Field numbering follows the nested depth-first rule used by the bit sets
//! on the wire: offset 0 is the whole structure, a structure node precedes
//! its children, and children are numbered in declaration order. Setting a
//! structure's own bit stands for "everything below it".

use std::{collections::HashMap, sync::Arc};

use bytes::{BufMut, BytesMut};

use crate::wire::{BitSet, PayloadReader, WireError, write_size, write_string};

/// Wire tag: no field follows.
const TYPE_NULL: u8 = 0xFF;
/// Wire tag: a cached introspection id follows.
const TYPE_ONLY_ID: u8 = 0xFE;
/// Wire tag: an id plus a full descriptor follow; cache it.
const TYPE_FULL_WITH_ID: u8 = 0xFD;

const CODE_SCALAR: u8 = 0x20;
const CODE_SCALAR_ARRAY: u8 = 0x28;
const CODE_STRUCTURE: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Boolean,
    Int,
    Long,
    Float,
    Double,
    String,
}

impl ScalarKind {
    fn code(self) -> u8 {
        match self {
            ScalarKind::Boolean => 0,
            ScalarKind::Int => 1,
            ScalarKind::Long => 2,
            ScalarKind::Float => 3,
            ScalarKind::Double => 4,
            ScalarKind::String => 5,
        }
    }

    fn from_code(code: u8) -> Result<ScalarKind, WireError> {
        Ok(match code {
            0 => ScalarKind::Boolean,
            1 => ScalarKind::Int,
            2 => ScalarKind::Long,
            3 => ScalarKind::Float,
            4 => ScalarKind::Double,
            5 => ScalarKind::String,
            other => return Err(WireError::UnknownTypeCode(other)),
        })
    }
}

/// A type descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldDesc {
    Scalar(ScalarKind),
    ScalarArray(ScalarKind),
    Structure {
        id: String,
        fields: Vec<(String, Arc<FieldDesc>)>,
    },
}

impl FieldDesc {
    /// Build a structure descriptor from `(name, field)` pairs.
    pub fn structure(
        id: impl Into<String>,
        fields: Vec<(&str, FieldDesc)>,
    ) -> Arc<FieldDesc> {
        Arc::new(FieldDesc::Structure {
            id: id.into(),
            fields: fields
                .into_iter()
                .map(|(name, field)| (name.to_string(), Arc::new(field)))
                .collect(),
        })
    }

    /// Total number of field offsets this node occupies, itself included.
    pub fn number_fields(&self) -> usize {
        match self {
            FieldDesc::Scalar(_) | FieldDesc::ScalarArray(_) => 1,
            FieldDesc::Structure { fields, .. } => {
                1 + fields.iter().map(|(_, f)| f.number_fields()).sum::<usize>()
            }
        }
    }

    fn encode_full(&self, buf: &mut BytesMut) {
        match self {
            FieldDesc::Scalar(kind) => buf.put_u8(CODE_SCALAR | kind.code()),
            FieldDesc::ScalarArray(kind) => buf.put_u8(CODE_SCALAR_ARRAY | kind.code()),
            FieldDesc::Structure { id, fields } => {
                buf.put_u8(CODE_STRUCTURE);
                write_string(buf, id);
                write_size(buf, fields.len() as i32);
                for (name, field) in fields {
                    write_string(buf, name);
                    field.encode_full(buf);
                }
            }
        }
    }

    fn decode_full(reader: &mut PayloadReader<'_>) -> Result<FieldDesc, WireError> {
        let code = reader.u8()?;
        Self::decode_full_tagged(code, reader)
    }

    fn decode_full_tagged(
        code: u8,
        reader: &mut PayloadReader<'_>,
    ) -> Result<FieldDesc, WireError> {
        if code == CODE_STRUCTURE {
            let id = reader.string()?;
            let count = reader.count()?;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                let name = reader.string()?;
                fields.push((name, Arc::new(FieldDesc::decode_full(reader)?)));
            }
            return Ok(FieldDesc::Structure { id, fields });
        }
        match code & !0x07 {
            CODE_SCALAR => Ok(FieldDesc::Scalar(ScalarKind::from_code(code & 0x07)?)),
            CODE_SCALAR_ARRAY => Ok(FieldDesc::ScalarArray(ScalarKind::from_code(code & 0x07)?)),
            _ => Err(WireError::UnknownTypeCode(code)),
        }
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum PvValue {
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    BooleanArray(Vec<bool>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
    Structure(PvStructure),
}

impl PvValue {
    /// Zero value for a descriptor.
    pub fn zeroed(desc: &FieldDesc) -> PvValue {
        match desc {
            FieldDesc::Scalar(ScalarKind::Boolean) => PvValue::Boolean(false),
            FieldDesc::Scalar(ScalarKind::Int) => PvValue::Int(0),
            FieldDesc::Scalar(ScalarKind::Long) => PvValue::Long(0),
            FieldDesc::Scalar(ScalarKind::Float) => PvValue::Float(0.0),
            FieldDesc::Scalar(ScalarKind::Double) => PvValue::Double(0.0),
            FieldDesc::Scalar(ScalarKind::String) => PvValue::String(String::new()),
            FieldDesc::ScalarArray(ScalarKind::Boolean) => PvValue::BooleanArray(Vec::new()),
            FieldDesc::ScalarArray(ScalarKind::Int) => PvValue::IntArray(Vec::new()),
            FieldDesc::ScalarArray(ScalarKind::Long) => PvValue::LongArray(Vec::new()),
            FieldDesc::ScalarArray(ScalarKind::Float) => PvValue::FloatArray(Vec::new()),
            FieldDesc::ScalarArray(ScalarKind::Double) => PvValue::DoubleArray(Vec::new()),
            FieldDesc::ScalarArray(ScalarKind::String) => PvValue::StringArray(Vec::new()),
            FieldDesc::Structure { .. } => {
                PvValue::Structure(PvStructure::zeroed(&Arc::new(desc.clone())))
            }
        }
    }

    /// Number of elements, for array values.
    pub fn len(&self) -> usize {
        match self {
            PvValue::BooleanArray(v) => v.len(),
            PvValue::IntArray(v) => v.len(),
            PvValue::LongArray(v) => v.len(),
            PvValue::FloatArray(v) => v.len(),
            PvValue::DoubleArray(v) => v.len(),
            PvValue::StringArray(v) => v.len(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        match self {
            PvValue::Boolean(v) => buf.put_u8(*v as u8),
            PvValue::Int(v) => buf.put_i32(*v),
            PvValue::Long(v) => buf.put_i64(*v),
            PvValue::Float(v) => buf.put_f32(*v),
            PvValue::Double(v) => buf.put_f64(*v),
            PvValue::String(v) => write_string(buf, v),
            PvValue::BooleanArray(v) => {
                write_size(buf, v.len() as i32);
                for e in v {
                    buf.put_u8(*e as u8);
                }
            }
            PvValue::IntArray(v) => {
                write_size(buf, v.len() as i32);
                for e in v {
                    buf.put_i32(*e);
                }
            }
            PvValue::LongArray(v) => {
                write_size(buf, v.len() as i32);
                for e in v {
                    buf.put_i64(*e);
                }
            }
            PvValue::FloatArray(v) => {
                write_size(buf, v.len() as i32);
                for e in v {
                    buf.put_f32(*e);
                }
            }
            PvValue::DoubleArray(v) => {
                write_size(buf, v.len() as i32);
                for e in v {
                    buf.put_f64(*e);
                }
            }
            PvValue::StringArray(v) => {
                write_size(buf, v.len() as i32);
                for e in v {
                    write_string(buf, e);
                }
            }
            PvValue::Structure(v) => v.serialize_full(buf),
        }
    }

    pub fn deserialize(
        desc: &FieldDesc,
        reader: &mut PayloadReader<'_>,
    ) -> Result<PvValue, WireError> {
        Ok(match desc {
            FieldDesc::Scalar(ScalarKind::Boolean) => PvValue::Boolean(reader.u8()? != 0),
            FieldDesc::Scalar(ScalarKind::Int) => PvValue::Int(reader.i32()?),
            FieldDesc::Scalar(ScalarKind::Long) => PvValue::Long(reader.i64()?),
            FieldDesc::Scalar(ScalarKind::Float) => PvValue::Float(reader.f32()?),
            FieldDesc::Scalar(ScalarKind::Double) => PvValue::Double(reader.f64()?),
            FieldDesc::Scalar(ScalarKind::String) => PvValue::String(reader.string()?),
            FieldDesc::ScalarArray(kind) => {
                let count = reader.count()?;
                match kind {
                    ScalarKind::Boolean => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(reader.u8()? != 0);
                        }
                        PvValue::BooleanArray(v)
                    }
                    ScalarKind::Int => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(reader.i32()?);
                        }
                        PvValue::IntArray(v)
                    }
                    ScalarKind::Long => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(reader.i64()?);
                        }
                        PvValue::LongArray(v)
                    }
                    ScalarKind::Float => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(reader.f32()?);
                        }
                        PvValue::FloatArray(v)
                    }
                    ScalarKind::Double => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(reader.f64()?);
                        }
                        PvValue::DoubleArray(v)
                    }
                    ScalarKind::String => {
                        let mut v = Vec::with_capacity(count);
                        for _ in 0..count {
                            v.push(reader.string()?);
                        }
                        PvValue::StringArray(v)
                    }
                }
            }
            FieldDesc::Structure { .. } => {
                let mut value = PvStructure::zeroed(&Arc::new(desc.clone()));
                value.deserialize_full(reader)?;
                PvValue::Structure(value)
            }
        })
    }
}

/// A structure value paired with its descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct PvStructure {
    desc: Arc<FieldDesc>,
    values: Vec<PvValue>,
}

impl PvStructure {
    /// A structure with every field at its zero value.
    ///
    /// The descriptor must be a [`FieldDesc::Structure`].
    pub fn zeroed(desc: &Arc<FieldDesc>) -> PvStructure {
        let values = match desc.as_ref() {
            FieldDesc::Structure { fields, .. } => {
                fields.iter().map(|(_, f)| PvValue::zeroed(f)).collect()
            }
            _ => Vec::new(),
        };
        PvStructure {
            desc: desc.clone(),
            values,
        }
    }

    pub fn desc(&self) -> &Arc<FieldDesc> {
        &self.desc
    }

    pub fn number_fields(&self) -> usize {
        self.desc.number_fields()
    }

    fn field_names(&self) -> &[(String, Arc<FieldDesc>)] {
        match self.desc.as_ref() {
            FieldDesc::Structure { fields, .. } => fields,
            _ => &[],
        }
    }

    pub fn field(&self, name: &str) -> Option<&PvValue> {
        let index = self.field_names().iter().position(|(n, _)| n == name)?;
        self.values.get(index)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut PvValue> {
        let index = self.field_names().iter().position(|(n, _)| n == name)?;
        self.values.get_mut(index)
    }

    /// Dotted-path lookup, e.g. `record.queueSize`.
    pub fn sub_field(&self, path: &str) -> Option<&PvValue> {
        let mut current = self;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            let value = current.field(part)?;
            if parts.peek().is_none() {
                return Some(value);
            }
            match value {
                PvValue::Structure(inner) => current = inner,
                _ => return None,
            }
        }
        None
    }

    pub fn serialize_full(&self, buf: &mut BytesMut) {
        for value in &self.values {
            value.serialize(buf);
        }
    }

    /// Serialize only the fields named by `mask` (bit 0 means everything).
    pub fn serialize_masked(&self, buf: &mut BytesMut, mask: &BitSet) {
        if mask.get(0) {
            self.serialize_full(buf);
            return;
        }
        self.serialize_node(buf, mask, 1);
    }

    fn serialize_node(&self, buf: &mut BytesMut, mask: &BitSet, mut offset: usize) -> usize {
        for (value, (_, desc)) in self.values.iter().zip(self.field_names()) {
            let node_set = mask.get(offset);
            match value {
                PvValue::Structure(inner) => {
                    if node_set {
                        inner.serialize_full(buf);
                        offset += desc.number_fields();
                    } else {
                        offset = inner.serialize_node(buf, mask, offset + 1);
                    }
                }
                _ => {
                    if node_set {
                        value.serialize(buf);
                    }
                    offset += 1;
                }
            }
        }
        offset
    }

    pub fn deserialize_full(&mut self, reader: &mut PayloadReader<'_>) -> Result<(), WireError> {
        let descs: Vec<Arc<FieldDesc>> =
            self.field_names().iter().map(|(_, d)| d.clone()).collect();
        for (value, desc) in self.values.iter_mut().zip(descs) {
            *value = PvValue::deserialize(&desc, reader)?;
        }
        Ok(())
    }

    /// Apply the fields named by `mask` from the wire onto this value.
    pub fn deserialize_masked(
        &mut self,
        reader: &mut PayloadReader<'_>,
        mask: &BitSet,
    ) -> Result<(), WireError> {
        if mask.get(0) {
            return self.deserialize_full(reader);
        }
        self.deserialize_node(reader, mask, 1).map(|_| ())
    }

    fn deserialize_node(
        &mut self,
        reader: &mut PayloadReader<'_>,
        mask: &BitSet,
        mut offset: usize,
    ) -> Result<usize, WireError> {
        let descs: Vec<Arc<FieldDesc>> =
            self.field_names().iter().map(|(_, d)| d.clone()).collect();
        for (value, desc) in self.values.iter_mut().zip(descs) {
            let node_set = mask.get(offset);
            match value {
                PvValue::Structure(inner) => {
                    if node_set {
                        inner.deserialize_full(reader)?;
                        offset += desc.number_fields();
                    } else {
                        offset = inner.deserialize_node(reader, mask, offset + 1)?;
                    }
                }
                _ => {
                    if node_set {
                        *value = PvValue::deserialize(&desc, reader)?;
                    }
                    offset += 1;
                }
            }
        }
        Ok(offset)
    }
}

/// Fold bits that cover a whole substructure into the substructure's own bit.
///
/// Returns the set to its canonical compressed form: whenever every child of
/// a structure node is set, the children are cleared and the node bit is set
/// instead. An already-set node bit clears all of its descendants.
pub fn compress_bitset(set: &mut BitSet, desc: &FieldDesc) {
    compress_node(set, desc, 0);
}

fn compress_node(set: &mut BitSet, desc: &FieldDesc, offset: usize) -> (usize, bool) {
    match desc {
        FieldDesc::Scalar(_) | FieldDesc::ScalarArray(_) => (offset + 1, set.get(offset)),
        FieldDesc::Structure { fields, .. } => {
            let mut next = offset + 1;
            let mut all_children = !fields.is_empty();
            for (_, child) in fields {
                let (n, full) = compress_node(set, child, next);
                all_children &= full;
                next = n;
            }
            let full = set.get(offset) || all_children;
            if full {
                set.set(offset);
                for bit in offset + 1..next {
                    set.unset(bit);
                }
            }
            (next, full)
        }
    }
}

/// Per-circuit cache of type descriptors.
///
/// Outgoing descriptors are keyed by `Arc` identity: the common case is an
/// operation re-sending the same `pvRequest` structure, which then costs a
/// two-byte reference. The cached `Arc` is retained so the key stays valid.
#[derive(Default)]
pub struct IntrospectionRegistry {
    incoming: HashMap<u16, Arc<FieldDesc>>,
    outgoing: HashMap<usize, (u16, Arc<FieldDesc>)>,
    next_outgoing_id: u16,
}

impl IntrospectionRegistry {
    pub fn new() -> IntrospectionRegistry {
        IntrospectionRegistry::default()
    }

    pub fn serialize_field(&mut self, buf: &mut BytesMut, desc: Option<&Arc<FieldDesc>>) {
        let Some(desc) = desc else {
            buf.put_u8(TYPE_NULL);
            return;
        };
        let key = Arc::as_ptr(desc) as usize;
        if let Some((id, _)) = self.outgoing.get(&key) {
            buf.put_u8(TYPE_ONLY_ID);
            buf.put_u16(*id);
            return;
        }
        let id = self.next_outgoing_id;
        self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
        self.outgoing.insert(key, (id, desc.clone()));
        buf.put_u8(TYPE_FULL_WITH_ID);
        buf.put_u16(id);
        desc.encode_full(buf);
    }

    pub fn deserialize_field(
        &mut self,
        reader: &mut PayloadReader<'_>,
    ) -> Result<Option<Arc<FieldDesc>>, WireError> {
        match reader.u8()? {
            TYPE_NULL => Ok(None),
            TYPE_ONLY_ID => {
                let id = reader.u16()?;
                self.incoming
                    .get(&id)
                    .cloned()
                    .map(Some)
                    .ok_or(WireError::UnknownIntrospectionId(id))
            }
            TYPE_FULL_WITH_ID => {
                let id = reader.u16()?;
                let desc = Arc::new(FieldDesc::decode_full(reader)?);
                self.incoming.insert(id, desc.clone());
                Ok(Some(desc))
            }
            tag => Ok(Some(Arc::new(FieldDesc::decode_full_tagged(tag, reader)?))),
        }
    }

    /// Deserialize a structure descriptor and build its zeroed value.
    pub fn deserialize_structure_and_create(
        &mut self,
        reader: &mut PayloadReader<'_>,
    ) -> Result<PvStructure, WireError> {
        match self.deserialize_field(reader)? {
            Some(desc) if matches!(desc.as_ref(), FieldDesc::Structure { .. }) => {
                Ok(PvStructure::zeroed(&desc))
            }
            Some(_) | None => Err(WireError::UnknownTypeCode(TYPE_NULL)),
        }
    }

    pub fn serialize_pv_request(&mut self, buf: &mut BytesMut, request: Option<&PvRequest>) {
        let Some(request) = request else {
            buf.put_u8(TYPE_NULL);
            return;
        };
        let structure = request.to_structure();
        self.serialize_field(buf, Some(structure.desc()));
        structure.serialize_full(buf);
    }
}

/// A client-side request qualifier: which subfields to transfer and the
/// record options (queue size etc.) that tune the operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PvRequest {
    record: Vec<(String, String)>,
    fields: Vec<String>,
}

impl PvRequest {
    /// Request everything, no options.
    pub fn all() -> PvRequest {
        PvRequest::default()
    }

    /// Add an option under the `record` substructure.
    pub fn record_option(mut self, key: impl Into<String>, value: impl Into<String>) -> PvRequest {
        self.record.push((key.into(), value.into()));
        self
    }

    /// Select a subfield.
    pub fn field(mut self, name: impl Into<String>) -> PvRequest {
        self.fields.push(name.into());
        self
    }

    /// The monitor queue size, from `record.queueSize`.
    ///
    /// `None` when the option is absent; an error status when it is present
    /// but not an integer.
    pub fn queue_size(&self) -> Result<Option<i32>, crate::wire::Status> {
        let Some((_, raw)) = self.record.iter().find(|(k, _)| k == "queueSize") else {
            return Ok(None);
        };
        raw.parse::<i32>().map(Some).map_err(|_| {
            crate::wire::Status::error("queueSize type is not a valid integer")
        })
    }

    fn to_structure(&self) -> PvStructure {
        let mut top: Vec<(String, Arc<FieldDesc>)> = Vec::new();
        let mut values = Vec::new();
        if !self.record.is_empty() {
            let record_fields: Vec<(String, Arc<FieldDesc>)> = self
                .record
                .iter()
                .map(|(k, _)| (k.clone(), Arc::new(FieldDesc::Scalar(ScalarKind::String))))
                .collect();
            let record_desc = Arc::new(FieldDesc::Structure {
                id: String::new(),
                fields: record_fields,
            });
            let mut record_value = PvStructure::zeroed(&record_desc);
            for (k, v) in &self.record {
                *record_value.field_mut(k).unwrap() = PvValue::String(v.clone());
            }
            top.push(("record".to_string(), record_desc));
            values.push(PvValue::Structure(record_value));
        }
        if !self.fields.is_empty() {
            let field_fields: Vec<(String, Arc<FieldDesc>)> = self
                .fields
                .iter()
                .map(|name| {
                    (
                        name.clone(),
                        Arc::new(FieldDesc::Structure {
                            id: String::new(),
                            fields: Vec::new(),
                        }),
                    )
                })
                .collect();
            let field_desc = Arc::new(FieldDesc::Structure {
                id: String::new(),
                fields: field_fields,
            });
            top.push(("field".to_string(), field_desc.clone()));
            values.push(PvValue::Structure(PvStructure::zeroed(&field_desc)));
        }
        let desc = Arc::new(FieldDesc::Structure {
            id: String::new(),
            fields: top,
        });
        let mut structure = PvStructure::zeroed(&desc);
        structure.values = values;
        structure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_desc() -> Arc<FieldDesc> {
        FieldDesc::structure(
            "structure",
            vec![
                ("value", FieldDesc::Scalar(ScalarKind::Int)),
                ("count", FieldDesc::Scalar(ScalarKind::Long)),
                ("label", FieldDesc::Scalar(ScalarKind::String)),
            ],
        )
    }

    #[test]
    fn number_fields_counts_nested() {
        let nested = FieldDesc::structure(
            "outer",
            vec![
                ("value", FieldDesc::Scalar(ScalarKind::Int)),
                (
                    "alarm",
                    FieldDesc::Structure {
                        id: "alarm_t".to_string(),
                        fields: vec![
                            (
                                "severity".to_string(),
                                Arc::new(FieldDesc::Scalar(ScalarKind::Int)),
                            ),
                            (
                                "message".to_string(),
                                Arc::new(FieldDesc::Scalar(ScalarKind::String)),
                            ),
                        ],
                    },
                ),
            ],
        );
        assert_eq!(nested.number_fields(), 5);
    }

    #[test]
    fn registry_caches_descriptors() {
        let desc = counter_desc();
        let mut tx = IntrospectionRegistry::new();
        let mut full = BytesMut::new();
        tx.serialize_field(&mut full, Some(&desc));
        let mut cached = BytesMut::new();
        tx.serialize_field(&mut cached, Some(&desc));
        assert_eq!(full[0], TYPE_FULL_WITH_ID);
        assert_eq!(cached[0], TYPE_ONLY_ID);
        assert_eq!(cached.len(), 3);

        let mut rx = IntrospectionRegistry::new();
        let mut reader = PayloadReader::new(&full, true);
        let got = rx.deserialize_field(&mut reader).unwrap().unwrap();
        assert_eq!(got.as_ref(), desc.as_ref());
        let mut reader = PayloadReader::new(&cached, true);
        let via_id = rx.deserialize_field(&mut reader).unwrap().unwrap();
        assert_eq!(via_id.as_ref(), desc.as_ref());
    }

    #[test]
    fn registry_rejects_unknown_id() {
        let mut rx = IntrospectionRegistry::new();
        let raw = [TYPE_ONLY_ID, 0, 9];
        let mut reader = PayloadReader::new(&raw, true);
        assert!(matches!(
            rx.deserialize_field(&mut reader),
            Err(WireError::UnknownIntrospectionId(9))
        ));
    }

    #[test]
    fn null_field_round_trip() {
        let mut registry = IntrospectionRegistry::new();
        let mut buf = BytesMut::new();
        registry.serialize_field(&mut buf, None);
        let mut reader = PayloadReader::new(&buf, true);
        assert!(registry.deserialize_field(&mut reader).unwrap().is_none());
    }

    #[test]
    fn structure_full_round_trip() {
        let desc = counter_desc();
        let mut value = PvStructure::zeroed(&desc);
        *value.field_mut("value").unwrap() = PvValue::Int(7);
        *value.field_mut("count").unwrap() = PvValue::Long(-3);
        *value.field_mut("label").unwrap() = PvValue::String("ok".to_string());

        let mut buf = BytesMut::new();
        value.serialize_full(&mut buf);
        let mut copy = PvStructure::zeroed(&desc);
        let mut reader = PayloadReader::new(&buf, true);
        copy.deserialize_full(&mut reader).unwrap();
        assert_eq!(copy, value);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn masked_round_trip_touches_only_named_fields() {
        let desc = counter_desc();
        let mut source = PvStructure::zeroed(&desc);
        *source.field_mut("value").unwrap() = PvValue::Int(42);
        *source.field_mut("count").unwrap() = PvValue::Long(9);

        // only "count" (offset 2) changed
        let mask = BitSet::from_bits([2]);
        let mut buf = BytesMut::new();
        source.serialize_masked(&mut buf, &mask);

        let mut target = PvStructure::zeroed(&desc);
        *target.field_mut("value").unwrap() = PvValue::Int(1);
        let mut reader = PayloadReader::new(&buf, true);
        target.deserialize_masked(&mut reader, &mask).unwrap();
        assert_eq!(target.field("value"), Some(&PvValue::Int(1)));
        assert_eq!(target.field("count"), Some(&PvValue::Long(9)));
    }

    #[test]
    fn mask_bit_zero_means_everything() {
        let desc = counter_desc();
        let mut source = PvStructure::zeroed(&desc);
        *source.field_mut("value").unwrap() = PvValue::Int(5);
        let mask = BitSet::from_bits([0]);
        let mut buf = BytesMut::new();
        source.serialize_masked(&mut buf, &mask);
        let mut target = PvStructure::zeroed(&desc);
        let mut reader = PayloadReader::new(&buf, true);
        target.deserialize_masked(&mut reader, &mask).unwrap();
        assert_eq!(target, source);
    }

    #[test]
    fn compress_folds_complete_substructures() {
        let desc = FieldDesc::structure(
            "outer",
            vec![
                ("value", FieldDesc::Scalar(ScalarKind::Int)),
                (
                    "alarm",
                    FieldDesc::Structure {
                        id: String::new(),
                        fields: vec![
                            (
                                "severity".to_string(),
                                Arc::new(FieldDesc::Scalar(ScalarKind::Int)),
                            ),
                            (
                                "message".to_string(),
                                Arc::new(FieldDesc::Scalar(ScalarKind::String)),
                            ),
                        ],
                    },
                ),
            ],
        );
        // offsets: 0 outer, 1 value, 2 alarm, 3 severity, 4 message
        let mut set = BitSet::from_bits([3, 4]);
        compress_bitset(&mut set, &desc);
        assert_eq!(set, BitSet::from_bits([2]));

        // everything set collapses to the root
        let mut set = BitSet::from_bits([1, 3, 4]);
        compress_bitset(&mut set, &desc);
        assert_eq!(set, BitSet::from_bits([0]));

        // partial coverage is left alone
        let mut set = BitSet::from_bits([1, 3]);
        compress_bitset(&mut set, &desc);
        assert_eq!(set, BitSet::from_bits([1, 3]));
    }

    #[test]
    fn pv_request_queue_size() {
        assert_eq!(PvRequest::all().queue_size().unwrap(), None);
        let request = PvRequest::all().record_option("queueSize", "2");
        assert_eq!(request.queue_size().unwrap(), Some(2));
        let request = PvRequest::all().record_option("queueSize", "-1");
        assert_eq!(request.queue_size().unwrap(), Some(-1));
        let request = PvRequest::all().record_option("queueSize", "many");
        assert!(request.queue_size().is_err());
    }

    #[test]
    fn pv_request_serializes_through_registry() {
        let request = PvRequest::all()
            .record_option("queueSize", "2")
            .field("value");
        let mut registry = IntrospectionRegistry::new();
        let mut buf = BytesMut::new();
        registry.serialize_pv_request(&mut buf, Some(&request));
        assert_eq!(buf[0], TYPE_FULL_WITH_ID);

        let mut none = BytesMut::new();
        registry.serialize_pv_request(&mut none, None);
        assert_eq!(&none[..], &[TYPE_NULL]);
    }

    #[test]
    fn sub_field_path() {
        let request = PvRequest::all().record_option("queueSize", "4");
        let structure = request.to_structure();
        assert_eq!(
            structure.sub_field("record.queueSize"),
            Some(&PvValue::String("4".to_string()))
        );
        assert_eq!(structure.sub_field("record.missing"), None);
    }
}
