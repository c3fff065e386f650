//! Test doubles: a hand-driven transport and an in-process store

use crate::meta::{MetadataService, StaticMetadata};
use crate::volume::{ClientContext, ClientVolume};
use blockio_common::config::{ClientConfig, QueueConfig};
use blockio_common::{MAX_IO_SIZE, MessageHead, MessageStatus, OpCode, Result, SECTOR_SIZE};
use blockio_transport::{
    Acceptor, BdRef, BufferKind, BufferPool, CompletionHandler, Connection, Link,
    LoopbackNetwork, Transport, WcStatus, WireMessage, buffer_pool,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::{Duration, Instant};

type SentLog = Arc<Mutex<Vec<(String, WireMessage)>>>;

struct RecordingLink {
    peer: String,
    sent: SentLog,
}

impl Link for RecordingLink {
    fn send(&self, msg: WireMessage) -> Result<()> {
        self.sent.lock().push((self.peer.clone(), msg));
        Ok(())
    }

    fn close(&self) {}
}

/// Transport whose connections record what is sent and never answer
#[derive(Default)]
pub struct ManualTransport {
    down: Mutex<HashSet<String>>,
    conns: Mutex<Vec<Arc<Connection>>>,
    sent: SentLog,
    next_id: AtomicU64,
}

impl ManualTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, peer: &str, down: bool) {
        if down {
            self.down.lock().insert(peer.to_string());
        } else {
            self.down.lock().remove(peer);
        }
    }

    pub fn last_conn(&self) -> Option<Arc<Connection>> {
        self.conns.lock().last().cloned()
    }

    pub fn sent(&self) -> Vec<(String, WireMessage)> {
        self.sent.lock().clone()
    }
}

impl Transport for ManualTransport {
    fn connect(&self, peer: &str, handler: Arc<dyn CompletionHandler>) -> Result<Arc<Connection>> {
        if self.down.lock().contains(peer) {
            return Err(blockio_common::Error::connection_failed(format!("{peer} down")));
        }
        let link = RecordingLink {
            peer: peer.to_string(),
            sent: Arc::clone(&self.sent),
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, peer, Box::new(link), handler));
        conn.mark_ready();
        self.conns.lock().push(Arc::clone(&conn));
        Ok(conn)
    }
}

/// Keeps completions until the test feeds them to a processor
#[derive(Default)]
pub struct CapturingHandler {
    completions: Mutex<Vec<(BdRef, WcStatus, Arc<Connection>)>>,
}

impl CapturingHandler {
    pub fn take(&self) -> Vec<(BdRef, WcStatus, Arc<Connection>)> {
        std::mem::take(&mut *self.completions.lock())
    }
}

impl CompletionHandler for CapturingHandler {
    fn on_work_complete(&self, bd: BdRef, status: WcStatus, conn: &Arc<Connection>) {
        self.completions.lock().push((bd, status, Arc::clone(conn)));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Reply,
    /// Hold every request until `release_held`
    Silent,
}

type Held = (Arc<Connection>, MessageHead, Bytes);

/// Single-replica store answering over the loopback network
pub struct FakeStore {
    recv_pool: BufferPool,
    mode: Mutex<StoreMode>,
    meta_ver: AtomicU16,
    sectors: Mutex<HashMap<u64, Vec<u8>>>,
    held: Mutex<Vec<Held>>,
}

impl FakeStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            recv_pool: buffer_pool("fake-store", BufferKind::Command, 256, MAX_IO_SIZE),
            mode: Mutex::new(StoreMode::Reply),
            meta_ver: AtomicU16::new(0),
            sectors: Mutex::new(HashMap::new()),
            held: Mutex::new(Vec::new()),
        })
    }

    pub fn set_mode(&self, mode: StoreMode) {
        *self.mode.lock() = mode;
    }

    pub fn set_meta_ver(&self, meta_ver: u16) {
        self.meta_ver.store(meta_ver, Ordering::SeqCst);
    }

    /// Answer everything held so far
    pub fn release_held(&self) {
        let held = std::mem::take(&mut *self.held.lock());
        for (conn, head, payload) in held {
            self.answer(&conn, &head, &payload);
        }
    }

    /// Stored bytes, if every sector in range was written
    pub fn data_at(&self, offset: u64, length: usize) -> Option<Vec<u8>> {
        let sectors = self.sectors.lock();
        let mut out = Vec::with_capacity(length);
        for i in 0..(length as u64).div_ceil(SECTOR_SIZE) {
            out.extend_from_slice(sectors.get(&(offset / SECTOR_SIZE + i))?);
        }
        Some(out)
    }

    fn answer(&self, conn: &Arc<Connection>, head: &MessageHead, payload: &[u8]) {
        let meta_ver = self.meta_ver.load(Ordering::SeqCst);
        let reply = |status, data| {
            let _ = conn.post_send(WireMessage::reply(head.reply(status, meta_ver), data));
        };
        if head.opcode != OpCode::Heartbeat && head.meta_ver != meta_ver {
            reply(MessageStatus::Reopen, None);
            return;
        }
        let first = head.offset / SECTOR_SIZE;
        let count = u64::from(head.length).div_ceil(SECTOR_SIZE);
        match head.opcode {
            OpCode::Write | OpCode::ReplicateWrite => {
                let mut sectors = self.sectors.lock();
                for (i, chunk) in payload.chunks(SECTOR_SIZE as usize).enumerate() {
                    sectors.insert(first + i as u64, chunk.to_vec());
                }
                drop(sectors);
                reply(MessageStatus::Success, None);
            }
            OpCode::Read => {
                let sectors = self.sectors.lock();
                let mut data = Vec::with_capacity(head.length as usize);
                for s in first..first + count {
                    match sectors.get(&s) {
                        Some(bytes) => data.extend_from_slice(bytes),
                        None => data.resize(data.len() + SECTOR_SIZE as usize, 0),
                    }
                }
                drop(sectors);
                reply(MessageStatus::Success, Some(Bytes::from(data)));
            }
            OpCode::Heartbeat => reply(MessageStatus::Success, None),
        }
    }
}

impl Acceptor for FakeStore {
    fn on_accept(&self, conn: &Arc<Connection>) {
        for _ in 0..32 {
            if let Some(bd) = self.recv_pool.alloc() {
                let _ = conn.post_recv(bd);
            }
        }
    }
}

impl CompletionHandler for FakeStore {
    fn on_work_complete(&self, bd: BdRef, status: WcStatus, conn: &Arc<Connection>) {
        if status != WcStatus::Success {
            return;
        }
        let (head, payload) = {
            let b = bd.lock();
            (b.head, Bytes::copy_from_slice(b.payload()))
        };
        let _ = conn.post_recv(bd);
        if *self.mode.lock() == StoreMode::Silent {
            self.held.lock().push((Arc::clone(conn), head, payload));
            return;
        }
        self.answer(conn, &head, &payload);
    }
}

/// Loopback network of fake stores plus a metadata directory
pub struct TestCluster {
    pub net: Arc<LoopbackNetwork>,
    pub meta: Arc<StaticMetadata>,
    pub ctx: ClientContext,
    stores: HashMap<String, Arc<FakeStore>>,
    addrs: Vec<String>,
}

impl TestCluster {
    pub fn new(addrs: &[&str]) -> Self {
        Self::with_depth(addrs, 8)
    }

    pub fn with_depth(addrs: &[&str], io_depth: usize) -> Self {
        let net = LoopbackNetwork::new();
        let mut stores = HashMap::new();
        for addr in addrs {
            let store = FakeStore::new();
            net.listen(
                *addr,
                Arc::clone(&store) as Arc<dyn Acceptor>,
                Arc::clone(&store) as Arc<dyn CompletionHandler>,
            );
            stores.insert((*addr).to_string(), store);
        }
        let meta = Arc::new(StaticMetadata::new());
        let config = ClientConfig {
            io_depth,
            io_timeout_ms: 300,
            timeout_check_interval_ms: 20,
            heartbeat_interval_ms: 60_000,
            reconnect_interval_ms: 50,
            ..ClientConfig::default()
        };
        let ctx = ClientContext {
            config,
            queue: QueueConfig::default(),
            meta: Arc::clone(&meta) as Arc<dyn MetadataService>,
            transport: Arc::clone(&net) as Arc<dyn Transport>,
        };
        Self {
            net,
            meta,
            ctx,
            stores,
            addrs: addrs.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn store(&self, addr: &str) -> Arc<FakeStore> {
        Arc::clone(&self.stores[addr])
    }

    pub fn open(&self, name: &str, size: u64) -> ClientVolume {
        let addrs: Vec<&str> = self.addrs.iter().map(String::as_str).collect();
        self.meta
            .insert(StaticMetadata::simple_volume(name, 1, size, &addrs));
        ClientVolume::open(name, None, &self.ctx).unwrap()
    }

    pub fn wait_until(&self, f: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}
