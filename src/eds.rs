// eds.rs - EDS file parsing and object-model preseeding
//
// EDS files look like INI but are not: `$` starts a comment, an entry
// runs until the terminating `;` (possibly across lines) and values are
// comma-separated fields with optional double quotes. The loader pulls
// the [Device] identification out of the file, seeds the Identity /
// Message Router / Connection Manager classes, and stores the raw EDS
// bytes as File instance 1 so clients can upload it back out.

use std::collections::HashMap;

use crate::error::{PlcError, Result};
use crate::object::{
    Attribute, Class, Instance, CLASS_CONNECTION_MANAGER, CLASS_FILE, CLASS_IDENTITY,
    CLASS_MESSAGE_ROUTER,
};

pub(crate) type EdsMap = HashMap<String, HashMap<String, String>>;

/// Parses EDS text into section -> key -> raw value (without the `;`).
pub(crate) fn parse_eds(text: &str) -> Result<EdsMap> {
    let mut sections = EdsMap::new();
    let mut current = String::new();
    let mut pending = String::new();

    for raw_line in text.lines() {
        let line = match raw_line.find('$') {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if pending.is_empty() && line.starts_with('[') {
            let end = line
                .find(']')
                .ok_or_else(|| PlcError::Eds(format!("unterminated section: {}", line)))?;
            current = line[1..end].to_string();
            sections.entry(current.clone()).or_default();
            continue;
        }

        if !pending.is_empty() {
            pending.push(' ');
        }
        pending.push_str(line);

        if let Some(stripped) = pending.strip_suffix(';') {
            let entry = stripped.trim();
            if let Some(eq) = entry.find('=') {
                let key = entry[..eq].trim().to_string();
                let value = entry[eq + 1..].trim().to_string();
                if current.is_empty() {
                    return Err(PlcError::Eds(format!("entry outside a section: {}", key)));
                }
                sections.entry(current.clone()).or_default().insert(key, value);
            }
            pending.clear();
        }
    }

    Ok(sections)
}

/// First comma-separated field of a value, quotes stripped.
fn first_field(value: &str) -> &str {
    let field = value.split(',').next().unwrap_or("").trim();
    field.trim_matches('"')
}

fn field_u16(map: &EdsMap, section: &str, key: &str) -> Option<u16> {
    let value = map.get(section)?.get(key)?;
    let field = first_field(value);
    if let Some(hex) = field.strip_prefix("0x") {
        u16::from_str_radix(hex, 16).ok()
    } else {
        field.parse().ok()
    }
}

fn field_str<'a>(map: &'a EdsMap, section: &str, key: &str) -> Option<&'a str> {
    map.get(section).and_then(|s| s.get(key)).map(|v| first_field(v))
}

/// Two's-complement 16-bit checksum over a file payload, the value the
/// File object serves as attribute 7.
pub(crate) fn file_checksum(data: &[u8]) -> u16 {
    let sum: u32 = data.iter().fold(0u32, |acc, &b| (acc + b as u32) & 0xFFFF);
    (0x1_0000 - sum) as u16
}

/// Builds a File instance holding `content`.
pub(crate) fn file_instance(name: &str, content: Vec<u8>) -> Instance {
    let mut inst = Instance::with_data(content);
    inst.set_attr(1, Attribute::usint("State", 3)); // file loaded
    inst.set_attr(2, Attribute::short_string("InstanceName", name));
    inst.set_attr(6, Attribute::udint("FileSize", inst.data.len() as u32));
    inst.set_attr(7, Attribute::uint("Checksum", file_checksum(&inst.data)));
    inst
}

/// Seeds the class registry from optional EDS text.
///
/// Identity attributes fall back to generic values when the EDS omits a
/// field (or no EDS is given at all); the registry always carries the
/// Identity, Message Router and Connection Manager classes, plus the File
/// class when there is EDS content to serve.
pub(crate) fn seed_classes(eds_text: Option<&str>, serial: u32) -> Result<HashMap<u16, Class>> {
    let eds = match eds_text {
        Some(text) => Some(parse_eds(text)?),
        None => None,
    };
    let empty = EdsMap::new();
    let map = eds.as_ref().unwrap_or(&empty);

    let vendor = field_u16(map, "Device", "VendCode").unwrap_or(1);
    let device_type = field_u16(map, "Device", "ProdType").unwrap_or(0x000C);
    let product_code = field_u16(map, "Device", "ProdCode").unwrap_or(1);
    let maj_rev = field_u16(map, "Device", "MajRev").unwrap_or(1) as u8;
    let min_rev = field_u16(map, "Device", "MinRev").unwrap_or(1) as u8;
    let product_name = field_str(map, "Device", "ProdName").unwrap_or("Virtual PLC");

    let mut identity = Class::new("Identity");
    let mut inst = Instance::new();
    inst.set_attr(1, Attribute::uint("VendorID", vendor));
    inst.set_attr(2, Attribute::uint("DeviceType", device_type));
    inst.set_attr(3, Attribute::uint("ProductCode", product_code));
    inst.set_attr(4, Attribute::new("Revision", vec![maj_rev, min_rev]));
    inst.set_attr(5, Attribute::uint("Status", 0));
    inst.set_attr(6, Attribute::udint("SerialNumber", serial));
    inst.set_attr(7, Attribute::short_string("ProductName", product_name));
    identity.set_instance(1, inst);

    let mut router = Class::new("Message Router");
    router.set_instance(1, Instance::new());

    let mut conn_mgr = Class::new("Connection Manager");
    conn_mgr.set_instance(1, Instance::new());

    let mut classes = HashMap::new();
    classes.insert(CLASS_IDENTITY, identity);
    classes.insert(CLASS_MESSAGE_ROUTER, router);
    classes.insert(CLASS_CONNECTION_MANAGER, conn_mgr);

    if let Some(text) = eds_text {
        let mut file = Class::new("File");
        file.set_instance(1, file_instance("EDS and Icon Files", text.as_bytes().to_vec()));
        classes.insert(CLASS_FILE, file);
    }

    Ok(classes)
}
