// cip.rs - CIP service dispatcher
//
// Routes a decoded CIP request (service + EPATH + body) to the object
// model, the tag store or the connection bookkeeping, and produces the
// reply body. Replies always start with the four-byte header
// `{service|0x80, reserved, generalStatus, additionalStatusSize}`.

use bytes::Buf;
use log::debug;

use crate::encap::UNCONNECTED_MESSAGE_LIMIT;
use crate::epath::ParsedPath;
use crate::object::{CLASS_SYMBOL, Instance};
use crate::tag::TagAccessError;
use crate::PlcInner;

/// Bit set on the service code of every reply.
pub const REPLY_FLAG: u8 = 0x80;

/// CIP service codes handled by the dispatcher.
pub mod service {
    pub const GET_ATTR_ALL: u8 = 0x01;
    pub const GET_ATTR_LIST: u8 = 0x03;
    pub const RESET: u8 = 0x05;
    pub const GET_ATTR_SINGLE: u8 = 0x0E;
    pub const INITIATE_UPLOAD: u8 = 0x4B;
    pub const READ_TAG: u8 = 0x4C;
    pub const WRITE_TAG: u8 = 0x4D;
    pub const FORWARD_CLOSE: u8 = 0x4E;
    pub const UPLOAD_TRANSFER: u8 = 0x4F;
    pub const FORWARD_OPEN: u8 = 0x54;
    pub const GET_INST_ATTR_LIST: u8 = 0x55;
}

/// CIP general status codes.
pub mod status {
    pub const SUCCESS: u8 = 0x00;
    pub const CONNECTION_FAILURE: u8 = 0x01;
    pub const RESOURCE_UNAVAILABLE: u8 = 0x02;
    pub const INVALID_PARAMETER_VALUE: u8 = 0x03;
    pub const PATH_SEGMENT_ERROR: u8 = 0x04;
    pub const PATH_UNKNOWN: u8 = 0x05;
    /// Reported when a GetAttributeList misses an attribute; shares the
    /// numeric value of PATH_UNKNOWN on this wire contract.
    pub const ATTR_LIST_ERROR: u8 = 0x05;
    pub const PARTIAL_TRANSFER: u8 = 0x06;
    pub const SERVICE_NOT_SUPPORTED: u8 = 0x08;
    pub const INVALID_ATTRIBUTE: u8 = 0x10;
    pub const NOT_ENOUGH_DATA: u8 = 0x13;
    pub const ATTR_NOT_SUPPORTED: u8 = 0x14;
    pub const INVALID_PARAMETER: u8 = 0x20;
}

/// Upload transfer packet types.
pub mod transfer {
    pub const FIRST_LAST: u8 = 0;
    pub const FIRST: u8 = 1;
    pub const LAST: u8 = 2;
    pub const MIDDLE: u8 = 3;
}

/// A dispatched reply body plus whether the service may be answered on
/// the connected transport.
pub(crate) struct CipReply {
    pub body: Vec<u8>,
    pub connected_capable: bool,
}

fn reply(service: u8, status: u8) -> Vec<u8> {
    vec![service | REPLY_FLAG, 0x00, status, 0x00]
}

/// Reply header carrying additional status words.
fn reply_with_words(service: u8, status: u8, words: &[u16]) -> Vec<u8> {
    let mut out = vec![service | REPLY_FLAG, 0x00, status, words.len() as u8];
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

impl CipReply {
    fn unconnected(body: Vec<u8>) -> CipReply {
        CipReply {
            body,
            connected_capable: false,
        }
    }

    fn connected(body: Vec<u8>) -> CipReply {
        CipReply {
            body,
            connected_capable: true,
        }
    }
}

pub(crate) fn dispatch(
    plc: &PlcInner,
    conn_id: &mut u32,
    service: u8,
    path: &ParsedPath,
    body: &[u8],
) -> CipReply {
    match service {
        service::GET_ATTR_ALL => CipReply::connected(get_attr_all(plc, service, path)),
        service::GET_ATTR_SINGLE => CipReply::connected(get_attr_single(plc, service, path)),
        service::GET_ATTR_LIST => CipReply::connected(get_attr_list(plc, service, path, body)),
        service::GET_INST_ATTR_LIST => {
            CipReply::connected(get_inst_attr_list(plc, service, path, body))
        }
        service::INITIATE_UPLOAD => CipReply::connected(initiate_upload(plc, service, path, body)),
        service::UPLOAD_TRANSFER => CipReply::connected(upload_transfer(plc, service, path, body)),
        service::READ_TAG => CipReply::connected(read_tag(plc, service, path, body)),
        service::WRITE_TAG => CipReply::connected(write_tag(plc, service, path, body)),
        service::FORWARD_OPEN => CipReply::unconnected(forward_open(conn_id, service, body)),
        service::FORWARD_CLOSE => CipReply::unconnected(forward_close(conn_id, service, body)),
        service::RESET => {
            debug!("Reset");
            plc.emit(service::RESET, status::SUCCESS, 0, None);
            CipReply::unconnected(reply(service, status::SUCCESS))
        }
        other => {
            debug!("unknown service 0x{:02X}", other);
            CipReply::unconnected(reply(other, status::SERVICE_NOT_SUPPORTED))
        }
    }
}

/// Synthesizes the class-level (instance 0) attribute of the Symbol
/// class, which has no stored instance.
fn symbol_meta_attr(plc: &PlcInner, attr: u16) -> Option<Vec<u8>> {
    let tags = plc.tags.read().unwrap();
    match attr {
        1 => Some(1u16.to_le_bytes().to_vec()),
        2 => Some((tags.last_instance() as u16).to_le_bytes().to_vec()),
        3 => Some((tags.len() as u16).to_le_bytes().to_vec()),
        _ => None,
    }
}

/// GetAttributesAll payload for a class/instance pair, `None` when the
/// target does not exist.
fn attr_all_bytes(plc: &PlcInner, class: u16, instance: u32) -> Option<Vec<u8>> {
    if class == CLASS_SYMBOL {
        if instance == 0 {
            let mut out = Vec::new();
            for attr in [1, 2, 3] {
                out.extend_from_slice(&symbol_meta_attr(plc, attr)?);
            }
            return Some(out);
        }
        let tags = plc.tags.read().unwrap();
        return tags.by_instance(instance).map(|t| t.symbol_attr_all());
    }
    let classes = plc.classes.read().unwrap();
    let inst = classes.get(&class)?.instance(instance)?;
    Some(inst.attr_all())
}

/// One attribute payload, `None` for a missing class/instance/attribute.
fn attr_bytes(plc: &PlcInner, class: u16, instance: u32, attr: u16) -> Option<Vec<u8>> {
    if class == CLASS_SYMBOL {
        if instance == 0 {
            return symbol_meta_attr(plc, attr);
        }
        let tags = plc.tags.read().unwrap();
        return tags.by_instance(instance).and_then(|t| t.symbol_attr(attr));
    }
    let classes = plc.classes.read().unwrap();
    classes
        .get(&class)
        .and_then(|c| c.instance(instance))
        .and_then(|inst| inst.attr(attr).map(|a| a.data.clone()))
}

fn instance_exists(plc: &PlcInner, class: u16, instance: u32) -> bool {
    if class == CLASS_SYMBOL {
        return instance == 0 || plc.tags.read().unwrap().by_instance(instance).is_some();
    }
    let classes = plc.classes.read().unwrap();
    classes
        .get(&class)
        .and_then(|c| c.instance(instance))
        .is_some()
}

fn get_attr_all(plc: &PlcInner, service: u8, path: &ParsedPath) -> Vec<u8> {
    let class = path.class.unwrap_or(0);
    let instance = path.instance.unwrap_or(0);
    debug!("GetAttributesAll class 0x{:02X} instance {}", class, instance);

    match attr_all_bytes(plc, class, instance) {
        Some(data) => {
            let mut out = reply(service, status::SUCCESS);
            out.extend_from_slice(&data);
            out
        }
        None => reply(service, status::PATH_UNKNOWN),
    }
}

fn get_attr_single(plc: &PlcInner, service: u8, path: &ParsedPath) -> Vec<u8> {
    let class = path.class.unwrap_or(0);
    let instance = path.instance.unwrap_or(0);
    let attr = path.attribute.unwrap_or(0);
    debug!(
        "GetAttributesSingle class 0x{:02X} instance {} attr {}",
        class, instance, attr
    );

    match attr_bytes(plc, class, instance, attr) {
        Some(data) => {
            let mut out = reply(service, status::SUCCESS);
            out.extend_from_slice(&data);
            out
        }
        None => reply(service, status::PATH_UNKNOWN),
    }
}

fn get_attr_list(plc: &PlcInner, service: u8, path: &ParsedPath, mut body: &[u8]) -> Vec<u8> {
    let class = path.class.unwrap_or(0);
    let instance = path.instance.unwrap_or(0);

    if body.remaining() < 2 {
        return reply(service, status::NOT_ENOUGH_DATA);
    }
    let count = body.get_u16_le();
    if body.remaining() < count as usize * 2 {
        return reply(service, status::NOT_ENOUGH_DATA);
    }
    debug!(
        "GetAttributesList class 0x{:02X} instance {} count {}",
        class, instance, count
    );

    if !instance_exists(plc, class, instance) {
        return reply(service, status::PATH_UNKNOWN);
    }

    let mut results = Vec::new();
    let mut any_miss = false;
    for _ in 0..count {
        let id = body.get_u16_le();
        results.extend_from_slice(&id.to_le_bytes());
        match attr_bytes(plc, class, instance, id) {
            Some(data) => {
                results.extend_from_slice(&(status::SUCCESS as u16).to_le_bytes());
                results.extend_from_slice(&data);
            }
            None => {
                any_miss = true;
                results.extend_from_slice(&(status::ATTR_NOT_SUPPORTED as u16).to_le_bytes());
            }
        }
    }

    let top = if any_miss {
        status::ATTR_LIST_ERROR
    } else {
        status::SUCCESS
    };
    let mut out = reply(service, top);
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&results);
    out
}

fn get_inst_attr_list(plc: &PlcInner, service: u8, path: &ParsedPath, mut body: &[u8]) -> Vec<u8> {
    let class = path.class.unwrap_or(0);
    let start = path.instance.unwrap_or(0);

    if body.remaining() < 2 {
        return reply(service, status::NOT_ENOUGH_DATA);
    }
    let count = body.get_u16_le();
    if body.remaining() < count as usize * 2 {
        return reply(service, status::NOT_ENOUGH_DATA);
    }
    let mut attrs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        attrs.push(body.get_u16_le());
    }
    debug!(
        "GetInstanceAttributeList class 0x{:02X} from {} attrs {:?}",
        class, start, attrs
    );

    // (instance id, attribute payloads) records, lazily collected
    let mut any_miss = false;
    let mut records: Vec<Vec<u8>> = Vec::new();
    let mut truncated = false;
    let mut body_len = 0usize;

    let mut push_record = |record: Vec<u8>| -> bool {
        if body_len + record.len() > UNCONNECTED_MESSAGE_LIMIT {
            return false;
        }
        body_len += record.len();
        records.push(record);
        true
    };

    if class == CLASS_SYMBOL {
        let tags = plc.tags.read().unwrap();
        for tag in tags.iter_from(start.max(1)) {
            let mut rec = Vec::new();
            rec.extend_from_slice(&tag.instance.to_le_bytes());
            for &attr in &attrs {
                match tag.symbol_attr(attr) {
                    Some(data) => rec.extend_from_slice(&data),
                    None => any_miss = true,
                }
            }
            if !push_record(rec) {
                truncated = true;
                break;
            }
        }
    } else {
        let classes = plc.classes.read().unwrap();
        let Some(cls) = classes.get(&class) else {
            return reply(service, status::PATH_UNKNOWN);
        };
        for (&id, inst) in cls.instances_from(start) {
            let mut rec = Vec::new();
            rec.extend_from_slice(&id.to_le_bytes());
            for &attr in &attrs {
                match inst.attr(attr) {
                    Some(a) => rec.extend_from_slice(&a.data),
                    None => any_miss = true,
                }
            }
            if !push_record(rec) {
                truncated = true;
                break;
            }
        }
    }

    let top = if truncated {
        status::PARTIAL_TRANSFER
    } else if any_miss {
        status::ATTR_LIST_ERROR
    } else {
        status::SUCCESS
    };
    let mut out = reply(service, top);
    for rec in records {
        out.extend_from_slice(&rec);
    }
    out
}

/// Looks up a File-style instance and runs `f` on it; answers
/// PATH_UNKNOWN when the target is missing. The Symbol class never
/// carries uploadable data.
fn with_file_instance<F>(plc: &PlcInner, service: u8, path: &ParsedPath, f: F) -> Vec<u8>
where
    F: FnOnce(&Instance) -> Vec<u8>,
{
    let class = path.class.unwrap_or(0);
    let instance = path.instance.unwrap_or(0);
    if class == CLASS_SYMBOL {
        return reply(service, status::PATH_UNKNOWN);
    }
    let classes = plc.classes.read().unwrap();
    match classes.get(&class).and_then(|c| c.instance(instance)) {
        Some(inst) => f(inst),
        None => reply(service, status::PATH_UNKNOWN),
    }
}

fn initiate_upload(plc: &PlcInner, service: u8, path: &ParsedPath, mut body: &[u8]) -> Vec<u8> {
    if body.remaining() < 1 {
        return reply(service, status::NOT_ENOUGH_DATA);
    }
    let max_size = body.get_u8();

    with_file_instance(plc, service, path, |inst| {
        debug!("InitiateUpload transfer size {}", max_size);
        let mut st = inst.upload.lock().unwrap();
        st.transfer_size = max_size;
        st.last_transfer = 0;
        st.rollover = 0;

        let mut out = reply(service, status::SUCCESS);
        out.extend_from_slice(&(inst.data.len() as u32).to_le_bytes()); // file size
        out.push(max_size); // granted transfer size
        out
    })
}

fn upload_transfer(plc: &PlcInner, service: u8, path: &ParsedPath, mut body: &[u8]) -> Vec<u8> {
    if body.remaining() < 1 {
        return reply(service, status::NOT_ENOUGH_DATA);
    }
    let tno = body.get_u8();

    with_file_instance(plc, service, path, |inst| {
        let mut st = inst.upload.lock().unwrap();

        let retry = tno == st.last_transfer;
        let next = st.last_transfer < 0xFF && tno == st.last_transfer + 1;
        let wrap = tno == 0 && st.last_transfer == 0xFF;
        if !(retry || next || wrap) {
            debug!("transfer number error: {} after {}", tno, st.last_transfer);
            return reply_with_words(service, status::INVALID_PARAMETER, &[0]);
        }
        if wrap {
            st.rollover = st.rollover.wrapping_add(1);
        }

        let size = st.transfer_size as usize;
        let total = inst.data.len();
        let pos = (tno as usize + 256 * st.rollover as usize) * size;
        let pos = pos.min(total);
        let end = (pos + size).min(total);
        let chunk = &inst.data[pos..end];

        let (packet_type, checksum) = if tno == 0 && total <= size {
            (transfer::FIRST_LAST, true)
        } else if tno == 0 && st.rollover == 0 {
            (transfer::FIRST, false)
        } else if pos + size >= total {
            (transfer::LAST, true)
        } else {
            (transfer::MIDDLE, false)
        };
        st.last_transfer = tno;
        debug!(
            "UploadTransfer {} type {} bytes {}..{}",
            tno, packet_type, pos, end
        );

        let mut out = reply(service, status::SUCCESS);
        out.push(tno);
        out.push(packet_type);
        out.extend_from_slice(chunk);
        if checksum {
            if let Some(attr) = inst.attr(7) {
                out.extend_from_slice(&attr.data);
            }
        }
        out
    })
}

fn read_tag(plc: &PlcInner, service: u8, path: &ParsedPath, mut body: &[u8]) -> Vec<u8> {
    let Some((name, index)) = path.symbol() else {
        plc.emit(service::READ_TAG, status::PATH_SEGMENT_ERROR, 0, None);
        return reply_with_words(service, status::PATH_SEGMENT_ERROR, &[0]);
    };
    if body.remaining() < 2 {
        return reply(service, status::NOT_ENOUGH_DATA);
    }
    let count = body.get_u16_le();
    debug!("ReadTag {} index {} count {}", name, index, count);

    let result = plc.tags.read().unwrap().read(name, index, count);
    match result {
        Ok((typ, data)) => {
            let snapshot = crate::Tag {
                name: name.to_string(),
                typ,
                count: count as u32,
                data: data.clone(),
                instance: 0,
            };
            plc.emit(service::READ_TAG, status::SUCCESS, index, Some(snapshot));
            let mut out = reply(service, status::SUCCESS);
            out.extend_from_slice(&typ.to_le_bytes());
            out.extend_from_slice(&data);
            out
        }
        Err(e) => {
            debug!("ReadTag {} refused: {:?}", name, e);
            plc.emit(service::READ_TAG, status::PATH_SEGMENT_ERROR, index, None);
            reply_with_words(service, status::PATH_SEGMENT_ERROR, &[0])
        }
    }
}

fn write_tag(plc: &PlcInner, service: u8, path: &ParsedPath, mut body: &[u8]) -> Vec<u8> {
    let Some((name, index)) = path.symbol() else {
        plc.emit(service::WRITE_TAG, status::PATH_SEGMENT_ERROR, 0, None);
        return reply_with_words(service, status::PATH_SEGMENT_ERROR, &[0]);
    };
    if body.remaining() < 4 {
        return reply(service, status::NOT_ENOUGH_DATA);
    }
    let typ = body.get_u16_le();
    let count = body.get_u16_le();
    debug!(
        "WriteTag {} type 0x{:04X} index {} count {}",
        name, typ, index, count
    );

    let result = plc
        .tags
        .write()
        .unwrap()
        .write(name, typ, index, count, body);
    match result {
        Ok(snapshot) => {
            plc.emit(service::WRITE_TAG, status::SUCCESS, index, Some(snapshot));
            reply(service, status::SUCCESS)
        }
        Err(TagAccessError::BadLength) => {
            debug!("WriteTag {} payload length mismatch", name);
            reply_with_words(service, status::INVALID_PARAMETER_VALUE, &[0])
        }
        Err(e) => {
            debug!("WriteTag {} refused: {:?}", name, e);
            plc.emit(service::WRITE_TAG, status::PATH_SEGMENT_ERROR, index, None);
            reply_with_words(service, status::PATH_SEGMENT_ERROR, &[0])
        }
    }
}

fn forward_open(conn_id: &mut u32, service: u8, mut body: &[u8]) -> Vec<u8> {
    // priority/tick + timeout ticks + two conn IDs + serial + vendor +
    // originator serial + multiplier + reserved + two RPI/param pairs +
    // transport class + path size
    if body.remaining() < 36 {
        return reply(service, status::NOT_ENOUGH_DATA);
    }
    let _priority_time_tick = body.get_u8();
    let _timeout_ticks = body.get_u8();
    let _ot_connection_id = body.get_u32_le();
    let to_connection_id = body.get_u32_le();
    let conn_serial = body.get_u16_le();
    let vendor_id = body.get_u16_le();
    let originator_serial = body.get_u32_le();
    let _timeout_multiplier = body.get_u8();
    body.advance(3); // reserved
    let ot_rpi = body.get_u32_le();
    let _ot_params = body.get_u16_le();
    let to_rpi = body.get_u32_le();
    let _to_params = body.get_u16_le();
    let _transport_class = body.get_u8();
    let conn_path_words = body.get_u8() as usize;
    if body.remaining() < conn_path_words * 2 {
        return reply(service, status::NOT_ENOUGH_DATA);
    }

    // Allocate the server-side (O->T) connection ID for this socket
    let id = loop {
        let id: u32 = rand::random();
        if id != 0 {
            break id;
        }
    };
    *conn_id = id;
    debug!("ForwardOpen conn 0x{:08X} serial 0x{:04X}", id, conn_serial);

    let mut out = reply(service, status::SUCCESS);
    out.extend_from_slice(&id.to_le_bytes()); // O->T connection ID
    out.extend_from_slice(&to_connection_id.to_le_bytes()); // T->O echoed
    out.extend_from_slice(&conn_serial.to_le_bytes());
    out.extend_from_slice(&vendor_id.to_le_bytes());
    out.extend_from_slice(&originator_serial.to_le_bytes());
    out.extend_from_slice(&ot_rpi.to_le_bytes()); // O->T API
    out.extend_from_slice(&to_rpi.to_le_bytes()); // T->O API
    out.push(0); // application reply size
    out.push(0); // reserved
    out
}

fn forward_close(conn_id: &mut u32, service: u8, mut body: &[u8]) -> Vec<u8> {
    // priority/tick + timeout ticks + serial + vendor + originator
    // serial + path size + reserved
    if body.remaining() < 12 {
        return reply(service, status::NOT_ENOUGH_DATA);
    }
    let _priority_time_tick = body.get_u8();
    let _timeout_ticks = body.get_u8();
    let conn_serial = body.get_u16_le();
    let vendor_id = body.get_u16_le();
    let originator_serial = body.get_u32_le();
    let conn_path_words = body.get_u8() as usize;
    let _reserved = body.get_u8();
    if body.remaining() < conn_path_words * 2 {
        return reply(service, status::NOT_ENOUGH_DATA);
    }

    debug!("ForwardClose conn 0x{:08X}", *conn_id);
    *conn_id = 0;

    let mut out = reply(service, status::SUCCESS);
    out.extend_from_slice(&conn_serial.to_le_bytes());
    out.extend_from_slice(&vendor_id.to_le_bytes());
    out.extend_from_slice(&originator_serial.to_le_bytes());
    out.push(0); // application reply size
    out.push(0); // reserved
    out
}
