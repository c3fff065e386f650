//! Store server: dispatcher workers, engine and forwarder behind one endpoint
//!
//! Accepted connections are assigned to a dispatcher round-robin and stay
//! with it; every command received on a connection is handled by that one
//! worker.

use crate::dispatcher::{Dispatcher, DispatcherStats, ServerEvent};
use crate::engine::{FileEngine, IoEngine, MemoryEngine};
use crate::forward::Forwarder;
use crate::replica::{LocalReplica, RemoteReplica, Replica, ServerVolume};
use blockio_common::config::{EngineKind, QueueConfig, ServerConfig};
use blockio_common::{Config, Error, HealthStatus, MAX_IO_SIZE, MessageStatus, Result};
use blockio_event::{EventPoster, EventWorker};
use blockio_transport::{
    Acceptor, BdRef, BufferKind, BufferPool, CompletionHandler, Connection, LoopbackNetwork,
    Transport, WcStatus, WireMessage, buffer_pool,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Acceptor and completion handler of a store's inbound connections
pub struct ServerEndpoint {
    name: String,
    posters: Vec<EventPoster<Dispatcher>>,
    next: AtomicUsize,
    assigned: Mutex<HashMap<u64, usize>>,
    recv_pool: BufferPool,
    recv_depth: usize,
}

impl ServerEndpoint {
    fn poster_of(&self, conn: &Connection) -> &EventPoster<Dispatcher> {
        let index = self.assigned.lock().get(&conn.id()).copied().unwrap_or(0);
        &self.posters[index % self.posters.len()]
    }

    /// Connections currently assigned to a dispatcher
    #[must_use]
    pub fn connections(&self) -> usize {
        self.assigned.lock().len()
    }
}

impl Acceptor for ServerEndpoint {
    fn on_accept(&self, conn: &Arc<Connection>) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.posters.len();
        self.assigned.lock().insert(conn.id(), index);
        let mut posted = 0;
        for _ in 0..self.recv_depth {
            let Some(bd) = self.recv_pool.alloc() else {
                warn!("{}: command buffers exhausted accepting {}", self.name, conn);
                break;
            };
            if conn.post_recv(bd).is_err() {
                break;
            }
            posted += 1;
        }
        info!(
            "{}: accepted {} on dispatcher {} with {} receives",
            self.name, conn, index, posted
        );
    }
}

impl CompletionHandler for ServerEndpoint {
    fn on_work_complete(&self, bd: BdRef, status: WcStatus, conn: &Arc<Connection>) {
        match status {
            WcStatus::Success => {}
            WcStatus::FlushError => return,
            WcStatus::LengthError => {
                let head = bd.lock().head;
                let _ = conn.post_send(WireMessage::reply(
                    head.reply(MessageStatus::InvalidField, head.meta_ver),
                    None,
                ));
                let _ = conn.post_recv(bd);
                return;
            }
        }
        let event = ServerEvent::IoRequest {
            bd,
            conn: Arc::clone(conn),
        };
        if let Err(r) = self.poster_of(conn).post(event) {
            let (e, event) = r.into_parts();
            warn!("{}: request on {} not queued: {}", self.name, conn, e);
            if let ServerEvent::IoRequest { bd, conn } = event {
                let head = bd.lock().head;
                let _ = conn.post_send(WireMessage::reply(
                    head.reply(MessageStatus::NoResource, head.meta_ver),
                    None,
                ));
                let _ = conn.post_recv(bd);
            }
        }
    }

    fn on_close(&self, conn: &Arc<Connection>) {
        let poster = self.poster_of(conn).clone();
        self.assigned.lock().remove(&conn.id());
        if let Err(r) = poster.post(ServerEvent::ConnClosed(Arc::clone(conn))) {
            debug!("{}: close of {} not delivered: {}", self.name, conn, r.reason);
        }
    }
}

pub struct StoreServer {
    name: String,
    engine: Arc<dyn IoEngine>,
    forwarder: Arc<Forwarder>,
    workers: Vec<EventWorker<Dispatcher>>,
    posters: Vec<EventPoster<Dispatcher>>,
    stats: Vec<Arc<DispatcherStats>>,
    endpoint: Arc<ServerEndpoint>,
}

impl StoreServer {
    /// Start a store with the engine selected in `config`
    pub fn start(name: &str, config: &Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let engine: Arc<dyn IoEngine> = match config.server.engine {
            EngineKind::Memory => Arc::new(MemoryEngine::new(name, config.server.engine_capacity)),
            EngineKind::File => {
                let path = config.server.engine_path.as_deref().ok_or_else(|| {
                    Error::configuration("server.engine_path is required for the file engine")
                })?;
                Arc::new(FileEngine::open(
                    path,
                    config.server.engine_capacity,
                    config.server.engine_threads,
                )?)
            }
        };
        Self::with_engine(name, &config.server, &config.queue, engine, transport)
    }

    pub fn with_engine(
        name: &str,
        config: &ServerConfig,
        queue: &QueueConfig,
        engine: Arc<dyn IoEngine>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let count = config.dispatcher_count.max(1);
        let mut workers = Vec::with_capacity(count);
        let mut posters = Vec::with_capacity(count);
        let mut stats = Vec::with_capacity(count);
        for i in 0..count {
            let worker_name = format!("{name}-disp{i}");
            let mut worker = EventWorker::new(worker_name.as_str(), queue);
            let poster = worker.poster();
            let dispatcher = Dispatcher::new(worker_name, poster.clone(), config.io_depth);
            stats.push(dispatcher.stats());
            worker.start(dispatcher)?;
            workers.push(worker);
            posters.push(poster);
        }

        let endpoint = Arc::new(ServerEndpoint {
            name: name.to_string(),
            posters: posters.clone(),
            next: AtomicUsize::new(0),
            assigned: Mutex::new(HashMap::new()),
            recv_pool: buffer_pool(
                &format!("{name}-cmd"),
                BufferKind::Command,
                config.recv_depth * config.max_connections.max(1),
                MAX_IO_SIZE,
            ),
            recv_depth: config.recv_depth,
        });
        let forwarder = Arc::new(Forwarder::new(name, transport, config.io_depth * count));
        info!(
            "Store {} started: {} dispatchers, engine {}",
            name,
            count,
            engine.name()
        );
        Ok(Self {
            name: name.to_string(),
            engine,
            forwarder,
            workers,
            posters,
            stats,
            endpoint,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn engine(&self) -> Arc<dyn IoEngine> {
        Arc::clone(&self.engine)
    }

    #[must_use]
    pub fn endpoint(&self) -> Arc<ServerEndpoint> {
        Arc::clone(&self.endpoint)
    }

    /// Accept connections on the in-process network
    pub fn listen_on(&self, net: &LoopbackNetwork, addr: &str) {
        net.listen(
            addr,
            Arc::clone(&self.endpoint) as Arc<dyn Acceptor>,
            Arc::clone(&self.endpoint) as Arc<dyn CompletionHandler>,
        );
    }

    /// Replica kept on this store's engine at `shard_base`
    #[must_use]
    pub fn local_replica(&self, rep_index: u8, shard_base: u64) -> Replica {
        Replica {
            rep_index,
            status: HealthStatus::Ok,
            backend: Arc::new(LocalReplica::new(self.engine(), shard_base)),
        }
    }

    /// Replica on the peer store at `addr`
    #[must_use]
    pub fn remote_replica(&self, rep_index: u8, addr: &str) -> Replica {
        Replica {
            rep_index,
            status: HealthStatus::Ok,
            backend: Arc::new(RemoteReplica::new(addr, Arc::clone(&self.forwarder))),
        }
    }

    /// Install `volume` on every dispatcher
    pub fn register_volume(&self, volume: &ServerVolume) -> Result<()> {
        for poster in &self.posters {
            let volume = volume.clone();
            poster.sync_invoke(move |d: &mut Dispatcher| d.add_volume(volume))?;
        }
        Ok(())
    }

    pub fn remove_volume(&self, volume_id: u64) -> Result<()> {
        for poster in &self.posters {
            poster.sync_invoke(move |d: &mut Dispatcher| d.remove_volume(volume_id))?;
        }
        Ok(())
    }

    /// Move a volume to a new metadata generation
    pub fn set_meta_ver(&self, volume_id: u64, meta_ver: u16) -> Result<()> {
        for poster in &self.posters {
            let found =
                poster.sync_invoke(move |d: &mut Dispatcher| d.set_meta_ver(volume_id, meta_ver))?;
            if !found {
                return Err(Error::VolumeNotFound(volume_id.to_string()));
            }
        }
        Ok(())
    }

    pub fn set_replica_status(
        &self,
        volume_id: u64,
        shard: usize,
        rep_index: u8,
        status: HealthStatus,
    ) -> Result<()> {
        for poster in &self.posters {
            let found = poster.sync_invoke(move |d: &mut Dispatcher| {
                d.set_replica_status(volume_id, shard, rep_index, status)
            })?;
            if !found {
                return Err(Error::VolumeNotFound(volume_id.to_string()));
            }
        }
        Ok(())
    }

    /// Free iocbs summed over all dispatchers
    pub fn free_iocbs(&self) -> Result<usize> {
        let mut free = 0;
        for poster in &self.posters {
            free += poster.sync_invoke(|d: &mut Dispatcher| d.free_iocbs())?;
        }
        Ok(free)
    }

    /// Iocb references still held, summed over all dispatchers
    pub fn held_iocb_refs(&self) -> Result<u64> {
        let mut held = 0;
        for poster in &self.posters {
            held += poster.sync_invoke(|d: &mut Dispatcher| d.held_iocb_refs())?;
        }
        Ok(held)
    }

    #[must_use]
    pub fn stats(&self) -> &[Arc<DispatcherStats>] {
        &self.stats
    }

    /// Subtasks dispatched so far across all dispatchers
    #[must_use]
    pub fn subtasks_dispatched(&self) -> u64 {
        self.stats
            .iter()
            .map(|s| s.subtasks.load(Ordering::Relaxed))
            .sum()
    }

    /// Drain and stop every dispatcher, then drop peer connections
    pub fn shutdown(&mut self) {
        for worker in &mut self.workers {
            let _ = worker.shutdown();
        }
        self.workers.clear();
        self.forwarder.close_all();
        info!("Store {} stopped", self.name);
    }
}

impl Drop for StoreServer {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}
