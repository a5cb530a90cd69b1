// lib.rs - Rust EtherNet/IP PLC Emulator
// =========================================================================
//
// # Rust EtherNet/IP Server
//
// A PLC emulator speaking EtherNet/IP encapsulation and CIP explicit
// (Class 3) messaging, the server-side counterpart of the
// `rust_ethernet_ip` client driver. Engineering tools and HMI clients can
// register sessions, enumerate the object model, read and write named
// tags, open CIP connections and upload File-object content in chunks.
//
// ## What it serves
//
// - **Encapsulation**: NOP, RegisterSession, UnRegisterSession,
//   ListIdentity, ListServices, ListInterfaces, SendRRData, SendUnitData
// - **CIP services**: GetAttributesAll/Single/List,
//   GetInstanceAttributeList, ReadTag, WriteTag, ForwardOpen,
//   ForwardClose, InitiateUpload, UploadTransfer, Reset
// - **Object model**: Identity, Message Router, Connection Manager, File
//   and Symbol classes; tags are mirrored as Symbol (0x6B) instances so
//   tag browsers see them
//
// ## Example
//
// ```rust,no_run
// use rust_ethernet_ip_server::{PlcServer, Tag};
//
// #[tokio::main]
// async fn main() -> Result<(), Box<dyn std::error::Error>> {
//     let plc = PlcServer::new(None, true)?;
//     plc.add_tag(Tag::dint("Counter", 42));
//     plc.add_tag(Tag::real_array("Temps", &[20.5, 21.0, 19.8]));
//
//     plc.on_event(|event| {
//         println!("service 0x{:02X} status 0x{:02X}", event.service, event.status);
//     });
//
//     plc.serve("0.0.0.0:44818").await?;
//     Ok(())
// }
// ```
//
// Not a PLC runtime: there is no ladder logic, no scan cycle, no Class
// 0/1 cyclic I/O and no CIP Security. Explicit messaging over TCP only.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::TcpSocket;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub mod cip;
pub mod encap;
pub mod epath;
pub mod error;
pub mod object;
pub mod tag;
pub mod types;

mod connection;
mod eds;
mod import;

pub use error::{PlcError, Result};
pub use import::{SymbolDb, SymbolEntry, TemplateEntry, TemplateMember};
pub use object::{Attribute, Class, Instance};
pub use tag::Tag;

use connection::serve_connection;
use tag::TagStore;

/// Default per-request read deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound on undelivered callback events before they are dropped.
const EVENT_QUEUE_DEPTH: usize = 64;

/// A protocol event delivered to the host callback.
///
/// Fired on ReadTag and WriteTag (with the affected data window as a tag
/// snapshot on success, `None` on failure) and on Reset.
#[derive(Debug, Clone)]
pub struct TagEvent {
    /// CIP service code (see [`cip::service`])
    pub service: u8,
    /// CIP general status the client saw (see [`cip::status`])
    pub status: u8,
    /// Element index of the access
    pub index: u32,
    pub tag: Option<Tag>,
}

/// Host callback invoked for tag traffic; runs on a dedicated task and
/// must be reentrant-safe.
pub type EventCallback = dyn Fn(&TagEvent) + Send + Sync;

/// Shared server state: object model, tag store and delivery plumbing.
pub(crate) struct PlcInner {
    pub(crate) classes: RwLock<HashMap<u16, Class>>,
    pub(crate) tags: RwLock<TagStore>,
    pub(crate) templates: RwLock<HashMap<String, TemplateEntry>>,
    pub(crate) local_addr: RwLock<Option<SocketAddr>>,
    pub(crate) shutdown: CancellationToken,
    timeout: RwLock<Duration>,
    callback: RwLock<Option<Arc<EventCallback>>>,
    event_tx: StdMutex<Option<mpsc::Sender<TagEvent>>>,
    serving: watch::Sender<bool>,
}

impl PlcInner {
    pub(crate) fn timeout(&self) -> Duration {
        *self.timeout.read().unwrap()
    }

    /// Queues an event for the host callback. Delivery is bounded: when
    /// the queue is full the event is dropped, never the protocol loop.
    pub(crate) fn emit(&self, service: u8, status: u8, index: u32, tag: Option<Tag>) {
        if self.callback.read().unwrap().is_none() {
            return;
        }
        let tx = self.event_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let event = TagEvent {
                service,
                status,
                index,
                tag,
            };
            if tx.try_send(event).is_err() {
                warn!("event queue full, dropping event");
            }
        }
    }
}

/// The PLC emulator.
///
/// Cheap to clone; all clones share the same object model and tag store.
/// Construct with [`PlcServer::new`], add tags, then [`PlcServer::serve`].
#[derive(Clone)]
pub struct PlcServer {
    inner: Arc<PlcInner>,
}

impl PlcServer {
    /// Creates a PLC with the object model preseeded from an optional
    /// EDS file.
    ///
    /// With `seed_test_tags` the store is preloaded with the documented
    /// `test*` fixture tags that clients and test suites rely on.
    pub fn new(eds_path: Option<&Path>, seed_test_tags: bool) -> Result<PlcServer> {
        let eds_text = match eds_path {
            Some(path) => Some(std::fs::read_to_string(path)?),
            None => None,
        };
        let classes = eds::seed_classes(eds_text.as_deref(), rand::random())?;

        let (serving, _) = watch::channel(false);
        let plc = PlcServer {
            inner: Arc::new(PlcInner {
                classes: RwLock::new(classes),
                tags: RwLock::new(TagStore::default()),
                templates: RwLock::new(HashMap::new()),
                local_addr: RwLock::new(None),
                shutdown: CancellationToken::new(),
                timeout: RwLock::new(DEFAULT_TIMEOUT),
                callback: RwLock::new(None),
                event_tx: StdMutex::new(None),
                serving,
            }),
        };

        if seed_test_tags {
            plc.seed_test_tags();
        }
        Ok(plc)
    }

    fn seed_test_tags(&self) {
        let fixtures = [
            Tag::raw("testBOOL", types::BOOL, 4, vec![0x00, 0x01, 0xFF, 0x55]),
            Tag::raw("testSINT", types::SINT, 4, vec![0xFF, 0xFE, 0x00, 0x01]),
            Tag::raw(
                "testINT",
                types::INT,
                10,
                vec![
                    0xFF, 0xFF, 0x00, 0x01, 0xFE, 0x00, 0xFC, 0x00, 0xCA, 0x00, 0xBD, 0x00, 0xB1,
                    0x00, 0xFF, 0x00, 127, 0x00, 128, 0x00,
                ],
            ),
            Tag::raw(
                "testDINT",
                types::DINT,
                2,
                vec![0xFF, 0xFF, 0xFF, 0xFF, 0x01, 0x00, 0x00, 0x00],
            ),
            Tag::raw(
                "testREAL",
                types::REAL,
                2,
                vec![0xA4, 0x70, 0x9D, 0x3F, 0xCD, 0xCC, 0x44, 0xC1],
            ),
            Tag::raw(
                "testDWORD",
                types::DWORD,
                2,
                vec![0xFF, 0xFF, 0xFF, 0xFF, 0x01, 0x00, 0x00, 0x00],
            ),
            Tag::raw(
                "testLINT",
                types::LINT,
                2,
                vec![
                    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01, 0x00, 0x00, 0x00, 0x00,
                    0x00, 0x00, 0x00,
                ],
            ),
            Tag::raw(
                "testASCII",
                types::SINT,
                17,
                vec![
                    b'H', b'e', b'l', b'l', b'o', b'!', 0x00, 0x01, 0x7F, 0xFE, 0xFC, 0xCA, 0xBD,
                    0xB1, 0xFF, 127, 128,
                ],
            ),
        ];
        let mut tags = self.inner.tags.write().unwrap();
        for fixture in fixtures.into_iter().flatten() {
            tags.insert(fixture);
        }
    }

    pub(crate) fn inner(&self) -> Arc<PlcInner> {
        self.inner.clone()
    }

    /// Adds a tag (or replaces one of the same name), making it visible
    /// as a Symbol Object instance.
    pub fn add_tag(&self, tag: Tag) {
        let name = tag.name.clone();
        let instance = self.inner.tags.write().unwrap().insert(tag);
        debug!("tag {} registered as symbol instance {}", name, instance);
    }

    /// Snapshot of a tag by name.
    pub fn tag(&self, name: &str) -> Option<Tag> {
        self.inner.tags.read().unwrap().get(name).cloned()
    }

    /// Overwrites tag data in place, starting at an element offset.
    pub fn update_tag(&self, name: &str, offset: usize, data: &[u8]) -> Result<()> {
        let mut tags = self.inner.tags.write().unwrap();
        let tag = tags
            .get_mut(name)
            .ok_or_else(|| PlcError::Tag(format!("no tag named {}", name)))?;
        let width = tag
            .elem_len()
            .ok_or_else(|| PlcError::Tag(format!("{}: string tags are replaced whole", name)))?;
        let start = offset * width;
        let end = start + data.len();
        if end > tag.data().len() {
            return Err(PlcError::Tag(format!(
                "{}: {} bytes at element {} exceed the tag",
                name,
                data.len(),
                offset
            )));
        }
        tag.data_mut()[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Registers (or replaces) a class in the object model.
    pub fn register_class(&self, class_id: u16, class: Class) {
        self.inner.classes.write().unwrap().insert(class_id, class);
    }

    /// Publishes an uploadable blob as a File object instance, with the
    /// size and checksum attributes clients expect.
    pub fn add_file(&self, instance_id: u32, name: &str, content: Vec<u8>) {
        let mut classes = self.inner.classes.write().unwrap();
        let class = classes
            .entry(object::CLASS_FILE)
            .or_insert_with(|| Class::new("File"));
        class.set_instance(instance_id, eds::file_instance(name, content));
    }

    /// Imports a JSON controller database (symbols + templates).
    pub fn import_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        self.import_json_str(&text)
    }

    /// Same as [`PlcServer::import_json`], from a string.
    pub fn import_json_str(&self, json: &str) -> Result<()> {
        let db: SymbolDb = serde_json::from_str(json)?;
        import::apply(&self.inner, db)
    }

    /// Template definition retained from a JSON import.
    pub fn template(&self, name: &str) -> Option<TemplateEntry> {
        self.inner.templates.read().unwrap().get(name).cloned()
    }

    /// Registers the host callback for tag traffic and reset events.
    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(&TagEvent) + Send + Sync + 'static,
    {
        *self.inner.callback.write().unwrap() = Some(Arc::new(callback));
    }

    /// Sets the per-request read deadline (default 60 s).
    pub fn set_timeout(&self, timeout: Duration) {
        *self.inner.timeout.write().unwrap() = timeout;
    }

    /// The bound listen address, available once [`PlcServer::serve`] has
    /// opened its listener (useful when serving on port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read().unwrap()
    }

    /// The bound listen port, 0 before the listener is up.
    pub fn port(&self) -> u16 {
        self.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Listens on `host` (e.g. `"0.0.0.0:44818"`) and serves connections
    /// until [`PlcServer::close`] is called.
    ///
    /// Each accepted connection runs on its own task; requests within a
    /// connection are strictly serialized.
    pub async fn serve(&self, host: &str) -> Result<()> {
        let addr: SocketAddr = host
            .parse()
            .map_err(|_| PlcError::Protocol(format!("invalid listen address: {}", host)))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(128)?;
        let bound = listener.local_addr()?;
        *self.inner.local_addr.write().unwrap() = Some(bound);

        // Event dispatcher: one task owns the callback invocations so the
        // protocol loops never block on host code.
        let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        *self.inner.event_tx.lock().unwrap() = Some(tx);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let callback = inner.callback.read().unwrap().clone();
                if let Some(callback) = callback {
                    callback(&event);
                }
            }
        });

        info!("serving EtherNet/IP on {}", bound);
        self.inner.serving.send_replace(true);

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("connection from {}", peer);
                        let inner = self.inner.clone();
                        tokio::spawn(async move {
                            serve_connection(inner, stream).await;
                        });
                    }
                    Err(e) => warn!("accept error: {}", e),
                },
            }
        }

        // Dropping the sender ends the event dispatcher
        *self.inner.event_tx.lock().unwrap() = None;
        debug!("serve shutdown");
        self.inner.serving.send_replace(false);
        Ok(())
    }

    /// Signals shutdown and waits for the accept loop to exit. In-flight
    /// connections drain cooperatively up to their read deadline.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let mut rx = self.inner.serving.subscribe();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}
