// import.rs - JSON symbol database import
//
// Loads a controller database dump: five controller attribute words, a
// symbol table and UDT template definitions. Symbols of fixed-width
// elementary types become zero-initialized tags under their recorded
// instance IDs; template metadata is retained for host inspection.
// Struct-typed symbols are skipped - the tag model is scalar/1-D
// elementary only.

use std::collections::HashMap;

use log::warn;
use serde::Deserialize;

use crate::error::Result;
use crate::object::{Attribute, Class, Instance, CLASS_CONTROLLER};
use crate::tag::Tag;
use crate::types;
use crate::PlcInner;

/// Top-level database document.
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolDb {
    /// Controller attribute values applied to class 0xAC instance 1
    pub ac: [i64; 5],
    #[serde(default)]
    pub symbols: HashMap<String, SymbolEntry>,
    #[serde(default)]
    pub templates: HashMap<String, TemplateEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolEntry {
    pub instance: u32,
    #[serde(default)]
    pub array: bool,
    #[serde(default, rename = "struct")]
    pub is_struct: bool,
    #[serde(default, rename = "type")]
    pub type_name: String,
    pub type_int: u32,
    pub type_size: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateEntry {
    pub handle: u32,
    pub size: u32,
    #[serde(default)]
    pub member: Vec<TemplateMember>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateMember {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub type_int: u32,
    pub type_size: u32,
    pub offset: u32,
    pub size: u32,
}

pub(crate) fn apply(plc: &PlcInner, db: SymbolDb) -> Result<()> {
    // Controller attributes: two INT words, then three DINTs (the last
    // one lives at attribute 10)
    {
        let mut classes = plc.classes.write().unwrap();
        let class = classes
            .entry(CLASS_CONTROLLER)
            .or_insert_with(|| Class::new("Controller"));
        if class.instance(1).is_none() {
            class.set_instance(1, Instance::new());
        }
        let inst = class.instance_mut(1).unwrap();
        inst.set_attr(1, Attribute::int("Attr1", db.ac[0] as i16));
        inst.set_attr(2, Attribute::int("Attr2", db.ac[1] as i16));
        inst.set_attr(3, Attribute::dint("Attr3", db.ac[2] as i32));
        inst.set_attr(4, Attribute::dint("Attr4", db.ac[3] as i32));
        inst.set_attr(10, Attribute::dint("Attr5", db.ac[4] as i32));
    }

    {
        let mut templates = plc.templates.write().unwrap();
        for (name, template) in &db.templates {
            templates.insert(name.clone(), template.clone());
        }
    }

    let mut tags = plc.tags.write().unwrap();
    for (name, sym) in &db.symbols {
        let typ = (sym.type_int & 0x0FFF) as u16;
        let count = sym.size.max(1);
        match types::type_len(typ) {
            Some(w) if !sym.is_struct => {
                let data = vec![0u8; w * count as usize];
                match Tag::raw(name.clone(), typ, count, data) {
                    Ok(tag) => tags.insert_at(tag, sym.instance),
                    Err(e) => warn!("symbol {} rejected: {}", name, e),
                }
            }
            _ => {
                warn!(
                    "skipping symbol {}: type {} (0x{:04X}) is not an elementary scalar/array",
                    name, sym.type_name, sym.type_int
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PlcServer;

    const DB: &str = r#"{
        "ac": [1, 2, 300000, -4, 5],
        "symbols": {
            "LineSpeed": {"instance": 20, "type": "DINT", "type_int": 196, "type_size": 4, "size": 1},
            "Temps": {"instance": 21, "array": true, "type": "REAL", "type_int": 202, "type_size": 4, "size": 8},
            "Recipe": {"instance": 22, "struct": true, "type": "RecipeUDT", "type_int": 36012, "type_size": 96, "size": 1}
        },
        "templates": {
            "RecipeUDT": {
                "handle": 4012,
                "size": 96,
                "member": [
                    {"name": "Setpoint", "type": "REAL", "type_int": 202, "type_size": 4, "offset": 0, "size": 1}
                ]
            }
        }
    }"#;

    #[test]
    fn test_import_primitive_symbols_and_controller_attrs() {
        let plc = PlcServer::new(None, false).unwrap();
        plc.import_json_str(DB).unwrap();

        let speed = plc.tag("LineSpeed").unwrap();
        assert_eq!(speed.typ, types::DINT);
        assert_eq!(speed.count, 1);
        assert_eq!(speed.data().len(), 4);

        let temps = plc.tag("Temps").unwrap();
        assert_eq!(temps.count, 8);
        assert_eq!(temps.data().len(), 32);

        // Struct symbol is skipped but its template is retained
        assert!(plc.tag("Recipe").is_none());
        let template = plc.template("RecipeUDT").unwrap();
        assert_eq!(template.handle, 4012);
        assert_eq!(template.member.len(), 1);

        let inner = plc.inner();
        let classes = inner.classes.read().unwrap();
        let inst = classes[&CLASS_CONTROLLER].instance(1).unwrap();
        assert_eq!(inst.attr(1).unwrap().data, 1i16.to_le_bytes().to_vec());
        assert_eq!(inst.attr(3).unwrap().data, 300000i32.to_le_bytes().to_vec());
        assert_eq!(inst.attr(10).unwrap().data, 5i32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_import_bad_json_fails() {
        let plc = PlcServer::new(None, false).unwrap();
        assert!(plc.import_json_str("{not json").is_err());
    }
}
