// connection.rs - Per-socket encapsulation request loop
//
// One task per accepted TCP connection. Requests are strictly
// serialized: a frame is read in full, dispatched, and its reply fully
// written before the next header is awaited. The loop owns three
// reusable buffers (request body, CPF envelope, service reply) that are
// cleared, not reallocated, between requests.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

use crate::cip;
use crate::encap::{
    command, encode_item, item, status as eip_status, CpfEnvelope, CpfItem, EncapsulationHeader,
    HEADER_LEN,
};
use crate::epath::parse_epath;
use crate::object::CLASS_IDENTITY;
use crate::PlcInner;

struct Conn<R, W> {
    plc: Arc<PlcInner>,
    rd: BufReader<R>,
    wr: W,
    head: EncapsulationHeader,
    /// O->T connection ID assigned at ForwardOpen, 0 when unconnected
    conn_id: u32,
    session_handle: u32,
    body: Vec<u8>,
    /// CPF envelope + item headers of a CIP reply
    cpf: Vec<u8>,
    /// Command payload / CIP reply body, written after `cpf`
    reply: Vec<u8>,
}

pub(crate) async fn serve_connection<S>(plc: Arc<PlcInner>, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (rd, wr) = tokio::io::split(stream);
    let conn = Conn {
        plc,
        rd: BufReader::new(rd),
        wr,
        head: EncapsulationHeader::default(),
        conn_id: 0,
        session_handle: 0,
        body: Vec::new(),
        cpf: Vec::new(),
        reply: Vec::new(),
    };
    conn.run().await;
}

impl<R, W> Conn<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn run(mut self) {
        loop {
            if self.plc.shutdown.is_cancelled() {
                break;
            }
            self.cpf.clear();
            self.reply.clear();

            let deadline = self.plc.timeout();
            let mut head = [0u8; HEADER_LEN];
            match timeout(deadline, self.rd.read_exact(&mut head)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    if e.kind() != std::io::ErrorKind::UnexpectedEof {
                        debug!("read error: {}", e);
                    }
                    break;
                }
                Err(_) => {
                    debug!("read deadline expired");
                    break;
                }
            }
            self.head = match EncapsulationHeader::decode(&head) {
                Ok(h) => h,
                Err(_) => break,
            };

            self.body.clear();
            self.body.resize(self.head.length as usize, 0);
            match timeout(deadline, self.rd.read_exact(&mut self.body)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!("read error: {}", e);
                    break;
                }
                Err(_) => {
                    debug!("read deadline expired");
                    break;
                }
            }

            let mut write_deadline = deadline;
            match self.head.command {
                command::NOP => continue,

                command::REGISTER_SESSION => {
                    self.session_handle = nonzero_random();
                    debug!("RegisterSession handle 0x{:08X}", self.session_handle);
                    self.head.session_handle = self.session_handle;
                    let body = std::mem::take(&mut self.body);
                    self.reply.extend_from_slice(&body); // echo protocol version
                    self.body = body;
                }

                command::UNREGISTER_SESSION => {
                    debug!("UnRegisterSession");
                    break;
                }

                command::LIST_IDENTITY => {
                    debug!("ListIdentity");
                    let payload = self.list_identity_payload();
                    self.reply.extend_from_slice(&payload);
                }

                command::LIST_SERVICES => {
                    debug!("ListServices");
                    let payload = list_services_payload();
                    self.reply.extend_from_slice(&payload);
                }

                command::LIST_INTERFACES => {
                    debug!("ListInterfaces");
                    self.reply.extend_from_slice(&0u16.to_le_bytes()); // no items
                }

                command::SEND_RR_DATA | command::SEND_UNIT_DATA => {
                    if let Some(ext) = self.handle_send_data() {
                        write_deadline = ext;
                    }
                }

                other => {
                    debug!("unknown command 0x{:04X}", other);
                    self.head.status = eip_status::INVALID_COMMAND;
                    let body = std::mem::take(&mut self.body);
                    self.reply.extend_from_slice(&body); // echo payload
                    self.body = body;
                }
            }

            self.head.length = (self.cpf.len() + self.reply.len()) as u16;
            let mut frame = Vec::with_capacity(HEADER_LEN + self.head.length as usize);
            self.head.encode_into(&mut frame);
            frame.extend_from_slice(&self.cpf);
            frame.extend_from_slice(&self.reply);

            match timeout(write_deadline, self.wr.write_all(&frame)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!("write error: {}", e);
                    break;
                }
                Err(_) => {
                    debug!("write deadline expired");
                    break;
                }
            }
        }
    }

    /// SendRRData / SendUnitData: CPF item demux, CIP dispatch, and the
    /// connected-vs-unconnected reply framing. Returns an extended write
    /// deadline when the request's CPF timeout field asks for one.
    fn handle_send_data(&mut self) -> Option<Duration> {
        let body = std::mem::take(&mut self.body);
        let ext = self.process_send_data(&body);
        self.body = body;
        ext
    }

    fn process_send_data(&mut self, body: &[u8]) -> Option<Duration> {
        let mut buf: &[u8] = body;

        let mut envelope = match CpfEnvelope::decode(&mut buf) {
            Ok(e) => e,
            Err(_) => {
                self.head.status = eip_status::INCORRECT_DATA;
                return None;
            }
        };
        let ext = if self.head.command == command::SEND_RR_DATA && envelope.timeout != 0 {
            Some(Duration::from_secs(envelope.timeout as u64))
        } else {
            None
        };

        if envelope.item_count != 2 {
            debug!("item count {} != 2", envelope.item_count);
            self.head.status = eip_status::INCORRECT_DATA;
            return ext;
        }

        let (addr_item, data_item) =
            match (CpfItem::decode(&mut buf), CpfItem::decode(&mut buf)) {
                (Ok(a), Ok(d)) => (a, d),
                _ => {
                    self.head.status = eip_status::INCORRECT_DATA;
                    return ext;
                }
            };

        let mut arrived_connected = false;
        let mut items_error = false;
        match addr_item.typ {
            item::NULL_ADDRESS => {}
            item::CONNECTED_ADDRESS if addr_item.data.len() >= 4 => {
                arrived_connected = true;
            }
            other => {
                debug!("unknown address item 0x{:04X}", other);
                items_error = true;
            }
        }

        let mut seq: u16 = 0;
        let cip_data: &[u8] = match data_item.typ {
            item::CONNECTED_DATA if data_item.data.len() >= 2 => {
                seq = u16::from_le_bytes([data_item.data[0], data_item.data[1]]);
                arrived_connected = true;
                &data_item.data[2..]
            }
            item::UNCONNECTED_DATA => data_item.data,
            other => {
                debug!("unknown data item 0x{:04X}", other);
                items_error = true;
                &[]
            }
        };

        if items_error {
            self.head.status = eip_status::INCORRECT_DATA;
            return ext;
        }

        // CIP request: service, path size in words, path, body
        if cip_data.len() < 2 {
            self.head.status = eip_status::INCORRECT_DATA;
            return ext;
        }
        let service = cip_data[0];
        let path_len = cip_data[1] as usize * 2;
        if cip_data.len() < 2 + path_len {
            self.head.status = eip_status::INCORRECT_DATA;
            return ext;
        }
        let parsed = match parse_epath(&cip_data[2..2 + path_len]) {
            Ok(p) => p,
            Err(e) => {
                debug!("EPATH error: {}", e);
                self.head.status = eip_status::INCORRECT_DATA;
                return ext;
            }
        };
        let service_body = &cip_data[2 + path_len..];

        let result = cip::dispatch(&self.plc, &mut self.conn_id, service, &parsed, service_body);
        self.reply.extend_from_slice(&result.body);

        envelope.interface_handle = 0;
        envelope.timeout = 0;
        envelope.item_count = 2;
        envelope.encode_into(&mut self.cpf);

        if arrived_connected && result.connected_capable && self.conn_id != 0 {
            encode_item(&mut self.cpf, item::CONNECTED_ADDRESS, &self.conn_id.to_le_bytes());
            // data item length covers the sequence count plus the reply
            self.cpf.extend_from_slice(&item::CONNECTED_DATA.to_le_bytes());
            self.cpf
                .extend_from_slice(&((2 + self.reply.len()) as u16).to_le_bytes());
            self.cpf.extend_from_slice(&seq.to_le_bytes());
        } else {
            encode_item(&mut self.cpf, item::NULL_ADDRESS, &[]);
            self.cpf.extend_from_slice(&item::UNCONNECTED_DATA.to_le_bytes());
            self.cpf
                .extend_from_slice(&(self.reply.len() as u16).to_le_bytes());
        }

        ext
    }

    /// ListIdentity response item: protocol version, big-endian socket
    /// address, the Identity object's attributes 1..7 and a state byte.
    fn list_identity_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u16.to_le_bytes()); // item count

        let mut body = Vec::new();
        body.extend_from_slice(&1u16.to_le_bytes()); // encapsulation protocol version

        // sockaddr_in in network byte order
        let addr = *self.plc.local_addr.read().unwrap();
        let (port, octets) = match addr {
            Some(a) => {
                let octets = match a.ip() {
                    IpAddr::V4(v4) => v4.octets(),
                    IpAddr::V6(_) => [0, 0, 0, 0],
                };
                (a.port(), octets)
            }
            None => (44818, [0, 0, 0, 0]),
        };
        body.extend_from_slice(&2u16.to_be_bytes()); // sin_family AF_INET
        body.extend_from_slice(&port.to_be_bytes());
        body.extend_from_slice(&octets);
        body.extend_from_slice(&[0u8; 8]); // sin_zero

        let classes = self.plc.classes.read().unwrap();
        if let Some(identity) = classes.get(&CLASS_IDENTITY).and_then(|c| c.instance(1)) {
            body.extend_from_slice(&identity.attr_all());
        }
        body.push(0x03); // state: operational

        encode_item(&mut payload, item::LIST_IDENTITY_RESPONSE, &body);
        payload
    }
}

/// ListServices response item: version, capability flags, padded name.
fn list_services_payload() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&1u16.to_le_bytes()); // item count

    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_le_bytes()); // protocol version
    body.extend_from_slice(&0x0020u16.to_le_bytes()); // TCP explicit messaging
    let mut name = [0u8; 16];
    name[..14].copy_from_slice(b"Communications");
    body.extend_from_slice(&name);

    encode_item(&mut payload, item::LIST_SERVICES_RESPONSE, &body);
    payload
}

fn nonzero_random() -> u32 {
    loop {
        let v: u32 = rand::random();
        if v != 0 {
            return v;
        }
    }
}
