// tag.rs - Named data tags and the concurrent tag store
//
// A tag is a named, typed, optionally array-valued buffer in packed
// little-endian wire format. The store owns every tag and doubles as the
// Symbol Object class (0x6B): each tag carries the instance ID it was
// assigned on insertion, and the symbol attributes clients enumerate are
// projected from the tag on demand instead of being kept in a second map.

use std::collections::{BTreeMap, HashMap};

use crate::error::{PlcError, Result};
use crate::types;

/// A named PLC data tag.
///
/// `data` always holds the packed little-endian encoding of `count`
/// elements; for the fixed-width types `data.len() == count * type_len`.
/// String-typed tags are self-describing (length prefix inside `data`)
/// and always have `count == 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub name: String,
    /// CIP elementary type code (see [`crate::types`])
    pub typ: u16,
    /// Element count; greater than 1 marks a 1-D array
    pub count: u32,
    pub(crate) data: Vec<u8>,
    /// Symbol Object instance ID, assigned when the tag enters the store
    pub(crate) instance: u32,
}

impl Tag {
    /// Builds a tag from raw wire-format bytes, validating the size
    /// invariant for fixed-width types.
    pub fn raw(name: impl Into<String>, typ: u16, count: u32, data: Vec<u8>) -> Result<Tag> {
        let name = name.into();
        if name.is_empty() {
            return Err(PlcError::Tag("tag name must not be empty".to_string()));
        }
        if !types::is_known(typ) {
            return Err(PlcError::Tag(format!("unknown type code 0x{:04X}", typ)));
        }
        if count == 0 {
            return Err(PlcError::Tag(format!("{}: count must be positive", name)));
        }
        if let Some(w) = types::type_len(typ) {
            if data.len() != w * count as usize {
                return Err(PlcError::Tag(format!(
                    "{}: {} x {} elements needs {} bytes, got {}",
                    name,
                    count,
                    types::type_name(typ),
                    w * count as usize,
                    data.len()
                )));
            }
        } else if count != 1 {
            return Err(PlcError::Tag(format!(
                "{}: string-typed tags are single-element",
                name
            )));
        }
        Ok(Tag {
            name,
            typ,
            count,
            data,
            instance: 0,
        })
    }

    fn fixed(name: impl Into<String>, typ: u16, count: u32, data: Vec<u8>) -> Tag {
        Tag {
            name: name.into(),
            typ,
            count,
            data,
            instance: 0,
        }
    }

    pub fn bool(name: impl Into<String>, v: bool) -> Tag {
        Self::fixed(name, types::BOOL, 1, vec![if v { 0xFF } else { 0x00 }])
    }

    pub fn bool_array(name: impl Into<String>, v: &[bool]) -> Tag {
        let data = v.iter().map(|&b| if b { 0xFF } else { 0x00 }).collect();
        Self::fixed(name, types::BOOL, v.len() as u32, data)
    }

    pub fn sint(name: impl Into<String>, v: i8) -> Tag {
        Self::fixed(name, types::SINT, 1, vec![v as u8])
    }

    pub fn sint_array(name: impl Into<String>, v: &[i8]) -> Tag {
        let data = v.iter().map(|&x| x as u8).collect();
        Self::fixed(name, types::SINT, v.len() as u32, data)
    }

    pub fn usint(name: impl Into<String>, v: u8) -> Tag {
        Self::fixed(name, types::USINT, 1, vec![v])
    }

    pub fn usint_array(name: impl Into<String>, v: &[u8]) -> Tag {
        Self::fixed(name, types::USINT, v.len() as u32, v.to_vec())
    }

    pub fn int(name: impl Into<String>, v: i16) -> Tag {
        Self::fixed(name, types::INT, 1, v.to_le_bytes().to_vec())
    }

    pub fn int_array(name: impl Into<String>, v: &[i16]) -> Tag {
        let data = v.iter().flat_map(|x| x.to_le_bytes()).collect();
        Self::fixed(name, types::INT, v.len() as u32, data)
    }

    pub fn uint(name: impl Into<String>, v: u16) -> Tag {
        Self::fixed(name, types::UINT, 1, v.to_le_bytes().to_vec())
    }

    pub fn uint_array(name: impl Into<String>, v: &[u16]) -> Tag {
        let data = v.iter().flat_map(|x| x.to_le_bytes()).collect();
        Self::fixed(name, types::UINT, v.len() as u32, data)
    }

    pub fn dint(name: impl Into<String>, v: i32) -> Tag {
        Self::fixed(name, types::DINT, 1, v.to_le_bytes().to_vec())
    }

    pub fn dint_array(name: impl Into<String>, v: &[i32]) -> Tag {
        let data = v.iter().flat_map(|x| x.to_le_bytes()).collect();
        Self::fixed(name, types::DINT, v.len() as u32, data)
    }

    pub fn udint(name: impl Into<String>, v: u32) -> Tag {
        Self::fixed(name, types::UDINT, 1, v.to_le_bytes().to_vec())
    }

    pub fn udint_array(name: impl Into<String>, v: &[u32]) -> Tag {
        let data = v.iter().flat_map(|x| x.to_le_bytes()).collect();
        Self::fixed(name, types::UDINT, v.len() as u32, data)
    }

    pub fn lint(name: impl Into<String>, v: i64) -> Tag {
        Self::fixed(name, types::LINT, 1, v.to_le_bytes().to_vec())
    }

    pub fn lint_array(name: impl Into<String>, v: &[i64]) -> Tag {
        let data = v.iter().flat_map(|x| x.to_le_bytes()).collect();
        Self::fixed(name, types::LINT, v.len() as u32, data)
    }

    pub fn ulint(name: impl Into<String>, v: u64) -> Tag {
        Self::fixed(name, types::ULINT, 1, v.to_le_bytes().to_vec())
    }

    pub fn ulint_array(name: impl Into<String>, v: &[u64]) -> Tag {
        let data = v.iter().flat_map(|x| x.to_le_bytes()).collect();
        Self::fixed(name, types::ULINT, v.len() as u32, data)
    }

    pub fn real(name: impl Into<String>, v: f32) -> Tag {
        Self::fixed(name, types::REAL, 1, v.to_le_bytes().to_vec())
    }

    pub fn real_array(name: impl Into<String>, v: &[f32]) -> Tag {
        let data = v.iter().flat_map(|x| x.to_le_bytes()).collect();
        Self::fixed(name, types::REAL, v.len() as u32, data)
    }

    pub fn lreal(name: impl Into<String>, v: f64) -> Tag {
        Self::fixed(name, types::LREAL, 1, v.to_le_bytes().to_vec())
    }

    pub fn lreal_array(name: impl Into<String>, v: &[f64]) -> Tag {
        let data = v.iter().flat_map(|x| x.to_le_bytes()).collect();
        Self::fixed(name, types::LREAL, v.len() as u32, data)
    }

    pub fn dword(name: impl Into<String>, v: u32) -> Tag {
        Self::fixed(name, types::DWORD, 1, v.to_le_bytes().to_vec())
    }

    pub fn dword_array(name: impl Into<String>, v: &[u32]) -> Tag {
        let data = v.iter().flat_map(|x| x.to_le_bytes()).collect();
        Self::fixed(name, types::DWORD, v.len() as u32, data)
    }

    /// STRING tag: 2-byte character count followed by the characters.
    pub fn string(name: impl Into<String>, v: &str) -> Tag {
        let mut data = Vec::with_capacity(2 + v.len());
        data.extend_from_slice(&(v.len() as u16).to_le_bytes());
        data.extend_from_slice(v.as_bytes());
        Self::fixed(name, types::STRING, 1, data)
    }

    /// SHORT_STRING tag: 1-byte character count followed by the characters.
    pub fn short_string(name: impl Into<String>, v: &str) -> Tag {
        let mut data = Vec::with_capacity(1 + v.len());
        data.push(v.len() as u8);
        data.extend_from_slice(v.as_bytes());
        Self::fixed(name, types::SHORT_STRING, 1, data)
    }

    /// Raw wire-format bytes of the tag value.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Element width, `None` for string types.
    pub fn elem_len(&self) -> Option<usize> {
        types::type_len(self.typ)
    }

    pub fn is_array(&self) -> bool {
        self.count > 1
    }

    /// SymbolType attribute value: the type code with the 1-D array bit.
    pub fn symbol_type(&self) -> u16 {
        if self.count > 1 {
            self.typ | types::ARRAY_FLAG
        } else {
            self.typ
        }
    }

    pub fn data_bool(&self) -> Vec<bool> {
        self.data.iter().map(|&b| b != 0).collect()
    }

    pub fn data_sint(&self) -> Vec<i8> {
        self.data.iter().map(|&b| b as i8).collect()
    }

    pub fn data_int(&self) -> Vec<i16> {
        self.data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    pub fn data_dint(&self) -> Vec<i32> {
        self.data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn data_dword(&self) -> Vec<u32> {
        self.data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn data_lint(&self) -> Vec<i64> {
        self.data
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    pub fn data_real(&self) -> Vec<f32> {
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn data_lreal(&self) -> Vec<f64> {
        self.data
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    /// Projects one Symbol Object instance attribute from this tag.
    ///
    /// Attribute 1 is SymbolName (2-byte length + characters), 2 is
    /// SymbolType, 7 is the base type size and 8 the dimension block
    /// (three u32 dimension counts, only the first used).
    pub(crate) fn symbol_attr(&self, attr: u16) -> Option<Vec<u8>> {
        match attr {
            1 => {
                let mut data = Vec::with_capacity(2 + self.name.len());
                data.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
                data.extend_from_slice(self.name.as_bytes());
                Some(data)
            }
            2 => Some(self.symbol_type().to_le_bytes().to_vec()),
            7 => {
                let w = types::type_len(self.typ).unwrap_or(0) as u16;
                Some(w.to_le_bytes().to_vec())
            }
            8 => {
                let mut data = Vec::with_capacity(12);
                data.extend_from_slice(&self.count.to_le_bytes());
                data.extend_from_slice(&[0u8; 8]);
                Some(data)
            }
            _ => None,
        }
    }

    /// All projected symbol attributes in ascending attribute order.
    pub(crate) fn symbol_attr_all(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for attr in [1, 2, 7, 8] {
            if let Some(data) = self.symbol_attr(attr) {
                out.extend_from_slice(&data);
            }
        }
        out
    }
}

/// Why a protocol-side tag access was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TagAccessError {
    NotFound,
    TypeMismatch,
    OutOfBounds,
    BadLength,
}

/// The owning tag map plus the Symbol Object instance numbering.
///
/// Guarded by one `RwLock` in `PlcServer`; protocol reads copy data out
/// while holding the read side so concurrent writers can never produce a
/// torn value.
#[derive(Debug, Default)]
pub(crate) struct TagStore {
    tags: HashMap<String, Tag>,
    by_instance: BTreeMap<u32, String>,
    last_instance: u32,
}

impl TagStore {
    /// Inserts or replaces a tag. A replaced tag keeps its symbol
    /// instance ID; a new tag gets the next free one.
    pub fn insert(&mut self, mut tag: Tag) -> u32 {
        let instance = match self.tags.get(&tag.name) {
            Some(old) => old.instance,
            None => {
                self.last_instance += 1;
                self.last_instance
            }
        };
        tag.instance = instance;
        self.by_instance.insert(instance, tag.name.clone());
        self.tags.insert(tag.name.clone(), tag);
        instance
    }

    /// Inserts a tag under a caller-chosen instance ID (JSON import).
    pub fn insert_at(&mut self, mut tag: Tag, instance: u32) {
        tag.instance = instance;
        self.last_instance = self.last_instance.max(instance);
        self.by_instance.insert(instance, tag.name.clone());
        self.tags.insert(tag.name.clone(), tag);
    }

    pub fn get(&self, name: &str) -> Option<&Tag> {
        self.tags.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tag> {
        self.tags.get_mut(name)
    }

    pub fn by_instance(&self, instance: u32) -> Option<&Tag> {
        self.by_instance
            .get(&instance)
            .and_then(|name| self.tags.get(name))
    }

    /// Tags in ascending instance order starting at `start`.
    pub fn iter_from(&self, start: u32) -> impl Iterator<Item = &Tag> {
        self.by_instance
            .range(start..)
            .filter_map(move |(_, name)| self.tags.get(name))
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn last_instance(&self) -> u32 {
        self.last_instance
    }

    /// Copies `count` elements starting at `index` out of a tag.
    ///
    /// String-typed tags are self-describing, so indexed access is only
    /// defined for `index == 0, count == 1` and returns the whole payload.
    pub fn read(
        &self,
        name: &str,
        index: u32,
        count: u16,
    ) -> std::result::Result<(u16, Vec<u8>), TagAccessError> {
        let tag = self.tags.get(name).ok_or(TagAccessError::NotFound)?;
        match types::type_len(tag.typ) {
            Some(w) => {
                let end = index as usize + count as usize;
                if end > tag.count as usize {
                    return Err(TagAccessError::OutOfBounds);
                }
                let bytes = tag.data[index as usize * w..end * w].to_vec();
                Ok((tag.typ, bytes))
            }
            None => {
                if index != 0 || count != 1 {
                    return Err(TagAccessError::OutOfBounds);
                }
                Ok((tag.typ, tag.data.clone()))
            }
        }
    }

    /// Overwrites `count` elements starting at `index`.
    ///
    /// Never creates or resizes a tag: a missing name, a type mismatch or
    /// an out-of-range window is refused and the store is left untouched.
    /// Returns a snapshot of the written window for event delivery.
    pub fn write(
        &mut self,
        name: &str,
        typ: u16,
        index: u32,
        count: u16,
        data: &[u8],
    ) -> std::result::Result<Tag, TagAccessError> {
        let tag = self.tags.get_mut(name).ok_or(TagAccessError::NotFound)?;
        if tag.typ != typ {
            return Err(TagAccessError::TypeMismatch);
        }
        let written = match types::type_len(typ) {
            Some(w) => {
                let end = index as usize + count as usize;
                if end > tag.count as usize {
                    return Err(TagAccessError::OutOfBounds);
                }
                let expected = count as usize * w;
                if data.len() < expected {
                    return Err(TagAccessError::BadLength);
                }
                tag.data[index as usize * w..end * w].copy_from_slice(&data[..expected]);
                data[..expected].to_vec()
            }
            None => {
                if index != 0 || count != 1 {
                    return Err(TagAccessError::OutOfBounds);
                }
                tag.data = data.to_vec();
                data.to_vec()
            }
        };
        Ok(Tag {
            name: name.to_string(),
            typ,
            count: count as u32,
            data: written,
            instance: tag.instance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_constructors_encode_little_endian() {
        let t = Tag::dint("Counter", 0x01020304);
        assert_eq!(t.typ, types::DINT);
        assert_eq!(t.count, 1);
        assert_eq!(t.data(), &[0x04, 0x03, 0x02, 0x01]);

        let t = Tag::int_array("Speeds", &[-1, 256]);
        assert_eq!(t.count, 2);
        assert_eq!(t.data(), &[0xFF, 0xFF, 0x00, 0x01]);

        let t = Tag::real("Temp", 1.0);
        assert_eq!(t.data(), &1.0f32.to_le_bytes());

        let t = Tag::bool_array("Flags", &[true, false]);
        assert_eq!(t.data(), &[0xFF, 0x00]);
    }

    #[test]
    fn test_string_constructors() {
        let t = Tag::string("Msg", "Hi");
        assert_eq!(t.data(), &[0x02, 0x00, b'H', b'i']);
        let t = Tag::short_string("Msg2", "Hi");
        assert_eq!(t.data(), &[0x02, b'H', b'i']);
    }

    #[test]
    fn test_raw_validates_size_invariant() {
        assert!(Tag::raw("ok", types::INT, 2, vec![0; 4]).is_ok());
        assert!(Tag::raw("short", types::INT, 2, vec![0; 3]).is_err());
        assert!(Tag::raw("", types::INT, 1, vec![0; 2]).is_err());
        assert!(Tag::raw("zero", types::INT, 0, vec![]).is_err());
        assert!(Tag::raw("badtype", 0x0042, 1, vec![0]).is_err());
    }

    #[test]
    fn test_typed_accessors_round_trip() {
        let t = Tag::dint_array("d", &[7, -8]);
        assert_eq!(t.data_dint(), vec![7, -8]);
        let t = Tag::real_array("r", &[1.5, -2.25]);
        assert_eq!(t.data_real(), vec![1.5, -2.25]);
        let t = Tag::lint_array("l", &[i64::MIN, i64::MAX]);
        assert_eq!(t.data_lint(), vec![i64::MIN, i64::MAX]);
    }

    #[test]
    fn test_symbol_attr_projection() {
        let mut store = TagStore::default();
        store.insert(Tag::int_array("X", &[0, 0, 0, 0]));
        let tag = store.get("X").unwrap();

        // SymbolName
        assert_eq!(tag.symbol_attr(1).unwrap(), vec![0x01, 0x00, b'X']);
        // SymbolType carries the array bit
        assert_eq!(
            tag.symbol_attr(2).unwrap(),
            (types::ARRAY_FLAG | types::INT).to_le_bytes().to_vec()
        );
        // Base type size
        assert_eq!(tag.symbol_attr(7).unwrap(), vec![0x02, 0x00]);
        // Dimension block: count in dim 0
        let dims = tag.symbol_attr(8).unwrap();
        assert_eq!(dims.len(), 12);
        assert_eq!(&dims[..4], &4u32.to_le_bytes());
        assert!(tag.symbol_attr(3).is_none());
    }

    #[test]
    fn test_store_assigns_and_keeps_instances() {
        let mut store = TagStore::default();
        let a = store.insert(Tag::dint("A", 1));
        let b = store.insert(Tag::dint("B", 2));
        assert_eq!(a, 1);
        assert_eq!(b, 2);

        // Replacing keeps the instance ID
        let a2 = store.insert(Tag::dint("A", 5));
        assert_eq!(a2, 1);
        assert_eq!(store.last_instance(), 2);
        assert_eq!(store.by_instance(1).unwrap().data_dint(), vec![5]);
    }

    #[test]
    fn test_read_window_and_bounds() {
        let mut store = TagStore::default();
        store.insert(Tag::int_array("W", &[10, 20, 30, 40]));

        let (typ, bytes) = store.read("W", 1, 2).unwrap();
        assert_eq!(typ, types::INT);
        assert_eq!(bytes, vec![20, 0, 30, 0]);

        assert_eq!(store.read("W", 3, 2), Err(TagAccessError::OutOfBounds));
        assert_eq!(store.read("missing", 0, 1), Err(TagAccessError::NotFound));
    }

    #[test]
    fn test_write_rejections_leave_store_untouched() {
        let mut store = TagStore::default();
        store.insert(Tag::dint_array("D", &[1, 2]));
        let before = store.get("D").unwrap().data().to_vec();

        assert_eq!(
            store.write("nope", types::DINT, 0, 1, &[0; 4]),
            Err(TagAccessError::NotFound)
        );
        assert_eq!(
            store.write("D", types::INT, 0, 1, &[0; 2]),
            Err(TagAccessError::TypeMismatch)
        );
        assert_eq!(
            store.write("D", types::DINT, 1, 2, &[0; 8]),
            Err(TagAccessError::OutOfBounds)
        );
        assert_eq!(
            store.write("D", types::DINT, 0, 2, &[0; 5]),
            Err(TagAccessError::BadLength)
        );
        assert_eq!(store.get("D").unwrap().data(), &before[..]);

        store.write("D", types::DINT, 1, 1, &9i32.to_le_bytes()).unwrap();
        assert_eq!(store.get("D").unwrap().data_dint(), vec![1, 9]);
    }
}
