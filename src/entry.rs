//! # Entries, Attributes, and Modifications
//!
//! An [`Entry`] is an insertion-ordered bag of attributes, each holding a
//! non-empty list of typed values. Attribute ids compare
//! case-insensitively, as directory attribute names do.
//!
//! The module also carries the entry serializer used by the master table
//! (a varint-framed byte codec) and the modification vocabulary
//! ([`ModOp`], [`Modification`]) consumed by the store's modify
//! operations.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::encoding::varint::{decode_varint, encode_varint, varint_len};
use crate::error::StoreError;

/// A directory attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Value::Text(s) => s.as_bytes(),
            Value::Binary(b) => b,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Binary(b)
    }
}

/// An attribute id with its values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    id: String,
    values: SmallVec<[Value; 2]>,
}

impl Attribute {
    pub fn new(id: impl Into<String>, values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            id: id.into(),
            values: values.into_iter().collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.values.contains(value)
    }

    /// Case-insensitive containment for text values.
    pub fn contains_text_ignore_case(&self, text: &str) -> bool {
        self.values
            .iter()
            .any(|v| v.as_text().is_some_and(|s| s.eq_ignore_ascii_case(text)))
    }

    pub fn remove_value(&mut self, value: &Value) -> bool {
        match self.values.iter().position(|v| v == value) {
            Some(pos) => {
                self.values.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn first(&self) -> Option<&Value> {
        self.values.first()
    }
}

/// Insertion-ordered attribute bag.
#[derive(Debug, Clone, Default)]
pub struct Entry {
    attrs: Vec<Attribute>,
}

impl Entry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor from `(id, [text values])` pairs.
    pub fn with_attrs<'a>(
        attrs: impl IntoIterator<Item = (&'a str, &'a [&'a str])>,
    ) -> Self {
        let mut entry = Entry::new();
        for (id, values) in attrs {
            entry.put(Attribute::new(
                id,
                values.iter().map(|v| Value::from(*v)),
            ));
        }
        entry
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attrs
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.attrs.iter().position(|a| a.id.eq_ignore_ascii_case(id))
    }

    pub fn get(&self, id: &str) -> Option<&Attribute> {
        self.position(id).map(|i| &self.attrs[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Attribute> {
        self.position(id).map(|i| &mut self.attrs[i])
    }

    /// Replaces (or appends) the whole attribute.
    pub fn put(&mut self, attribute: Attribute) {
        match self.position(attribute.id()) {
            Some(i) => self.attrs[i] = attribute,
            None => self.attrs.push(attribute),
        }
    }

    /// Appends a value, creating the attribute when absent.
    pub fn add_value(&mut self, id: &str, value: Value) {
        match self.get_mut(id) {
            Some(attr) => attr.push(value),
            None => self.attrs.push(Attribute::new(id, [value])),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Attribute> {
        self.position(id).map(|i| self.attrs.remove(i))
    }

    /// Removes one value; drops the attribute once its last value goes.
    pub fn remove_value(&mut self, id: &str, value: &Value) -> bool {
        let Some(i) = self.position(id) else {
            return false;
        };
        let removed = self.attrs[i].remove_value(value);
        if self.attrs[i].is_empty() {
            self.attrs.remove(i);
        }
        removed
    }

    pub fn first_text(&self, id: &str) -> Option<&str> {
        self.get(id)?.first()?.as_text()
    }

    /// Whether `objectClass` carries `class` (case-insensitive).
    pub fn has_object_class(&self, class: &str) -> bool {
        self.get("objectClass")
            .is_some_and(|a| a.contains_text_ignore_case(class))
    }

    /// Structural equality ignoring attribute order, value order, and
    /// attribute id case.
    pub fn same_content(&self, other: &Entry) -> bool {
        if self.attrs.len() != other.attrs.len() {
            return false;
        }
        self.attrs.iter().all(|attr| {
            other.get(attr.id()).is_some_and(|theirs| {
                attr.len() == theirs.len() && attr.values().iter().all(|v| theirs.contains(v))
            })
        })
    }

    // ---- serializer ------------------------------------------------------

    const TAG_TEXT: u8 = 0;
    const TAG_BINARY: u8 = 1;

    /// Serializes the entry for the master table.
    pub fn encode(&self) -> Vec<u8> {
        let mut size = varint_len(self.attrs.len() as u64);
        for attr in &self.attrs {
            size += varint_len(attr.id.len() as u64) + attr.id.len();
            size += varint_len(attr.values.len() as u64);
            for value in &attr.values {
                let bytes = value.as_bytes();
                size += 1 + varint_len(bytes.len() as u64) + bytes.len();
            }
        }

        let mut buf = vec![0u8; size];
        let mut at = encode_varint(self.attrs.len() as u64, &mut buf);
        for attr in &self.attrs {
            at += encode_varint(attr.id.len() as u64, &mut buf[at..]);
            buf[at..at + attr.id.len()].copy_from_slice(attr.id.as_bytes());
            at += attr.id.len();
            at += encode_varint(attr.values.len() as u64, &mut buf[at..]);
            for value in &attr.values {
                buf[at] = match value {
                    Value::Text(_) => Self::TAG_TEXT,
                    Value::Binary(_) => Self::TAG_BINARY,
                };
                at += 1;
                let bytes = value.as_bytes();
                at += encode_varint(bytes.len() as u64, &mut buf[at..]);
                buf[at..at + bytes.len()].copy_from_slice(bytes);
                at += bytes.len();
            }
        }
        debug_assert_eq!(at, size);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Entry> {
        let mut at = 0usize;
        let (attr_count, used) = decode_varint(&bytes[at..])?;
        at += used;

        let mut entry = Entry::new();
        for _ in 0..attr_count {
            let (id_len, used) = decode_varint(&bytes[at..])?;
            at += used;
            let id_end = at + id_len as usize;
            ensure!(id_end <= bytes.len(), "truncated entry attribute id");
            let id = std::str::from_utf8(&bytes[at..id_end])?.to_string();
            at = id_end;

            let (value_count, used) = decode_varint(&bytes[at..])?;
            at += used;
            ensure!(value_count > 0, "attribute '{id}' decoded with no values");

            let mut values = SmallVec::new();
            for _ in 0..value_count {
                ensure!(at < bytes.len(), "truncated entry value tag");
                let tag = bytes[at];
                at += 1;
                let (len, used) = decode_varint(&bytes[at..])?;
                at += used;
                let end = at + len as usize;
                ensure!(end <= bytes.len(), "truncated entry value");
                let raw = &bytes[at..end];
                at = end;
                values.push(match tag {
                    Self::TAG_TEXT => Value::Text(std::str::from_utf8(raw)?.to_string()),
                    Self::TAG_BINARY => Value::Binary(raw.to_vec()),
                    other => bail!("unknown entry value tag {other}"),
                });
            }
            entry.attrs.push(Attribute { id, values });
        }

        Ok(entry)
    }
}

/// Modification operation, mirroring the protocol's modify change types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModOp {
    Add,
    Remove,
    Replace,
}

impl TryFrom<u8> for ModOp {
    type Error = eyre::Report;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(ModOp::Add),
            1 => Ok(ModOp::Remove),
            2 => Ok(ModOp::Replace),
            code => Err(StoreError::UnknownModificationOp { code }.into()),
        }
    }
}

/// One modification item: an operation applied to one attribute.
#[derive(Debug, Clone)]
pub struct Modification {
    pub op: ModOp,
    pub attribute: Attribute,
}

impl Modification {
    pub fn new(op: ModOp, attribute: Attribute) -> Self {
        Self { op, attribute }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> Entry {
        Entry::with_attrs([
            ("objectClass", ["top", "person"].as_slice()),
            ("cn", ["a"].as_slice()),
            ("sn", ["A"].as_slice()),
        ])
    }

    #[test]
    fn attribute_lookup_is_case_insensitive() {
        let entry = person();
        assert!(entry.get("CN").is_some());
        assert!(entry.get("ObjectClass").is_some());
        assert!(entry.get("missing").is_none());
    }

    #[test]
    fn object_class_check_ignores_case() {
        let entry = person();
        assert!(entry.has_object_class("PERSON"));
        assert!(!entry.has_object_class("alias"));
    }

    #[test]
    fn remove_value_drops_empty_attribute() {
        let mut entry = person();
        assert!(entry.remove_value("sn", &Value::from("A")));
        assert!(entry.get("sn").is_none());
        assert!(!entry.remove_value("sn", &Value::from("A")));
    }

    #[test]
    fn codec_round_trips_text_and_binary() {
        let mut entry = person();
        entry.add_value("userPassword", Value::Binary(vec![0, 159, 146, 150]));
        entry.add_value("cn", Value::from("alias name"));

        let decoded = Entry::decode(&entry.encode()).unwrap();
        assert!(decoded.same_content(&entry));
        assert_eq!(
            decoded.get("userPassword").unwrap().first(),
            Some(&Value::Binary(vec![0, 159, 146, 150]))
        );
    }

    #[test]
    fn same_content_ignores_order() {
        let a = Entry::with_attrs([
            ("cn", ["x", "y"].as_slice()),
            ("sn", ["s"].as_slice()),
        ]);
        let b = Entry::with_attrs([
            ("sn", ["s"].as_slice()),
            ("CN", ["y", "x"].as_slice()),
        ]);
        assert!(a.same_content(&b));

        let c = Entry::with_attrs([("cn", ["x"].as_slice())]);
        assert!(!a.same_content(&c));
    }

    #[test]
    fn mod_op_codes_map_and_reject() {
        assert_eq!(ModOp::try_from(0).unwrap(), ModOp::Add);
        assert_eq!(ModOp::try_from(1).unwrap(), ModOp::Remove);
        assert_eq!(ModOp::try_from(2).unwrap(), ModOp::Replace);
        let err = ModOp::try_from(9).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::UnknownModificationOp { code: 9 })
        ));
    }

    #[test]
    fn decode_rejects_empty_valued_attributes() {
        // attr_count=1, id "cn", value_count=0
        let bytes = [1u8, 2, b'c', b'n', 0];
        assert!(Entry::decode(&bytes).is_err());
    }
}
