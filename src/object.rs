// object.rs - CIP object model: classes, instances, attributes
//
// The registry is populated once at startup (EDS load, JSON import) and
// then only read by the dispatcher. The one piece of runtime state living
// inside it - the per-instance upload scratch - is interior-mutable so
// serving never needs the registry write lock.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Identity object
pub const CLASS_IDENTITY: u16 = 0x01;
/// Message Router object
pub const CLASS_MESSAGE_ROUTER: u16 = 0x02;
/// Connection Manager object
pub const CLASS_CONNECTION_MANAGER: u16 = 0x06;
/// File object, carries uploadable blobs
pub const CLASS_FILE: u16 = 0x37;
/// Symbol object, enumerates named tags
pub const CLASS_SYMBOL: u16 = 0x6B;
/// Controller attribute object targeted by the JSON symbol database
pub const CLASS_CONTROLLER: u16 = 0xAC;

/// One instance attribute: raw little-endian payload plus a name kept for
/// logs and the host API.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub data: Vec<u8>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Attribute {
        Attribute {
            name: name.into(),
            data,
        }
    }

    pub fn usint(name: impl Into<String>, v: u8) -> Attribute {
        Self::new(name, vec![v])
    }

    pub fn uint(name: impl Into<String>, v: u16) -> Attribute {
        Self::new(name, v.to_le_bytes().to_vec())
    }

    pub fn int(name: impl Into<String>, v: i16) -> Attribute {
        Self::new(name, v.to_le_bytes().to_vec())
    }

    pub fn udint(name: impl Into<String>, v: u32) -> Attribute {
        Self::new(name, v.to_le_bytes().to_vec())
    }

    pub fn dint(name: impl Into<String>, v: i32) -> Attribute {
        Self::new(name, v.to_le_bytes().to_vec())
    }

    /// STRING attribute: 2-byte character count + characters.
    pub fn string(name: impl Into<String>, v: &str) -> Attribute {
        let mut data = Vec::with_capacity(2 + v.len());
        data.extend_from_slice(&(v.len() as u16).to_le_bytes());
        data.extend_from_slice(v.as_bytes());
        Self::new(name, data)
    }

    /// SHORT_STRING attribute: 1-byte character count + characters.
    pub fn short_string(name: impl Into<String>, v: &str) -> Attribute {
        let mut data = Vec::with_capacity(1 + v.len());
        data.push(v.len() as u8);
        data.extend_from_slice(v.as_bytes());
        Self::new(name, data)
    }
}

/// Chunked-upload session scratch, one per instance.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct UploadState {
    pub transfer_size: u8,
    pub last_transfer: u8,
    pub rollover: u8,
}

/// A class instance: sparse attribute map plus an optional raw payload
/// (File instances keep their uploadable content here).
#[derive(Debug, Default)]
pub struct Instance {
    attrs: BTreeMap<u16, Attribute>,
    pub data: Vec<u8>,
    pub(crate) upload: Mutex<UploadState>,
}

impl Instance {
    pub fn new() -> Instance {
        Instance::default()
    }

    pub fn with_data(data: Vec<u8>) -> Instance {
        Instance {
            data,
            ..Instance::default()
        }
    }

    pub fn set_attr(&mut self, id: u16, attr: Attribute) {
        self.attrs.insert(id, attr);
    }

    pub fn attr(&self, id: u16) -> Option<&Attribute> {
        self.attrs.get(&id)
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&u16, &Attribute)> {
        self.attrs.iter()
    }

    /// Concatenation of every attribute payload in ascending attribute
    /// order, the GetAttributesAll reply body.
    pub fn attr_all(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for attr in self.attrs.values() {
            out.extend_from_slice(&attr.data);
        }
        out
    }
}

/// A CIP class: keyed instances plus class-level attributes kept on
/// instance 0 (revision, highest instance ID, instance count).
#[derive(Debug)]
pub struct Class {
    pub name: String,
    instances: BTreeMap<u32, Instance>,
    last_instance: u32,
}

impl Class {
    pub fn new(name: impl Into<String>) -> Class {
        let mut meta = Instance::new();
        meta.set_attr(1, Attribute::uint("Revision", 1));
        meta.set_attr(2, Attribute::uint("MaxInstance", 0));
        meta.set_attr(3, Attribute::uint("NumInstances", 0));
        let mut instances = BTreeMap::new();
        instances.insert(0, meta);
        Class {
            name: name.into(),
            instances,
            last_instance: 0,
        }
    }

    /// Inserts an instance and refreshes the class-level bookkeeping
    /// attributes on instance 0.
    pub fn set_instance(&mut self, id: u32, instance: Instance) {
        self.instances.insert(id, instance);
        self.last_instance = self.last_instance.max(id);
        let count = self.instances.len() as u16 - 1;
        let max = self.last_instance as u16;
        if let Some(meta) = self.instances.get_mut(&0) {
            meta.set_attr(2, Attribute::uint("MaxInstance", max));
            meta.set_attr(3, Attribute::uint("NumInstances", count));
        }
    }

    pub fn instance(&self, id: u32) -> Option<&Instance> {
        self.instances.get(&id)
    }

    pub fn instance_mut(&mut self, id: u32) -> Option<&mut Instance> {
        self.instances.get_mut(&id)
    }

    /// Instances in ascending ID order starting at `start`, instance 0
    /// (the class-level metadata) excluded.
    pub fn instances_from(&self, start: u32) -> impl Iterator<Item = (&u32, &Instance)> {
        self.instances.range(start.max(1)..)
    }

    pub fn last_instance(&self) -> u32 {
        self.last_instance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_all_concatenates_in_ascending_order() {
        let mut inst = Instance::new();
        inst.set_attr(7, Attribute::uint("Checksum", 0xBEEF));
        inst.set_attr(1, Attribute::uint("Vendor", 1));
        inst.set_attr(3, Attribute::short_string("Name", "X"));
        assert_eq!(inst.attr_all(), vec![0x01, 0x00, 0x01, b'X', 0xEF, 0xBE]);
    }

    #[test]
    fn test_class_tracks_instance_bookkeeping() {
        let mut class = Class::new("File");
        class.set_instance(1, Instance::with_data(vec![1, 2, 3]));
        class.set_instance(4, Instance::new());

        assert_eq!(class.last_instance(), 4);
        let meta = class.instance(0).unwrap();
        assert_eq!(meta.attr(2).unwrap().data, 4u16.to_le_bytes().to_vec());
        assert_eq!(meta.attr(3).unwrap().data, 2u16.to_le_bytes().to_vec());

        let listed: Vec<u32> = class.instances_from(0).map(|(id, _)| *id).collect();
        assert_eq!(listed, vec![1, 4]);
        let listed: Vec<u32> = class.instances_from(2).map(|(id, _)| *id).collect();
        assert_eq!(listed, vec![4]);
    }
}
