//! Store connection pool
//!
//! Maps a store address to one shared connection. Shards resolve through
//! their candidate address list, advancing a rotating cursor past stores
//! that cannot be reached. A periodic heartbeat sweep evicts connections
//! that stopped answering.

use crate::connection::{CompletionHandler, Connection, Transport};
use blockio_common::config::TransportKind;
use blockio_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Candidate stores of one shard and the cursor into them
#[derive(Debug, Clone, Default)]
pub struct ShardRoute {
    pub index: usize,
    pub store_ips: Vec<String>,
    /// Candidate tried first on the next lookup
    pub current_ip: usize,
}

impl ShardRoute {
    #[must_use]
    pub fn new(index: usize, store_ips: Vec<String>) -> Self {
        Self {
            index,
            store_ips,
            current_ip: 0,
        }
    }
}

/// Outcome of one heartbeat sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatSweep {
    pub evicted: usize,
    pub sent: usize,
}

/// Pool of store connections shared by every shard of a volume
pub struct ConnectionPool {
    name: String,
    transports: Vec<(TransportKind, Arc<dyn Transport>)>,
    default_kind: TransportKind,
    handler: Arc<dyn CompletionHandler>,
    conns: Mutex<BTreeMap<String, Arc<Connection>>>,
}

impl ConnectionPool {
    pub fn new(
        name: impl Into<String>,
        default_kind: TransportKind,
        handler: Arc<dyn CompletionHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            transports: Vec::new(),
            default_kind,
            handler,
            conns: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register the transport used for `kind`
    #[must_use]
    pub fn with_transport(mut self, kind: TransportKind, transport: Arc<dyn Transport>) -> Self {
        self.transports.retain(|(k, _)| *k != kind);
        self.transports.push((kind, transport));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.lock().is_empty()
    }

    /// Return the pooled OK connection to `ip`, connecting if needed
    pub fn get_conn(&self, ip: &str, kind: TransportKind) -> Result<Arc<Connection>> {
        if let Some(conn) = self.conns.lock().get(ip) {
            if conn.is_ok() {
                return Ok(Arc::clone(conn));
            }
        }

        let transport = self
            .transports
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, t)| Arc::clone(t))
            .ok_or_else(|| Error::configuration(format!("no {kind:?} transport registered")))?;

        let conn = transport
            .connect(ip, Arc::clone(&self.handler))
            .inspect_err(|e| error!("{}: failed to connect to {}: {}", self.name, ip, e))?;

        let mut conns = self.conns.lock();
        if let Some(existing) = conns.get(ip) {
            if existing.is_ok() {
                let existing = Arc::clone(existing);
                drop(conns);
                conn.close();
                return Ok(existing);
            }
        }
        conns.insert(ip.to_string(), Arc::clone(&conn));
        drop(conns);

        info!("{}: connected to store {} as {}", self.name, ip, conn);
        Ok(conn)
    }

    /// Resolve a shard to a connection, failing over across its candidates
    ///
    /// Starts at `current_ip` and advances the cursor past every candidate
    /// that fails. Returns `None` only when all candidates failed; the
    /// cursor then points back at where it started.
    pub fn get_shard_conn(&self, shard: &mut ShardRoute) -> Option<Arc<Connection>> {
        let count = shard.store_ips.len();
        if count == 0 {
            return None;
        }
        shard.current_ip %= count;
        for _ in 0..count {
            let ip = &shard.store_ips[shard.current_ip];
            match self.get_conn(ip, self.default_kind) {
                Ok(conn) => return Some(conn),
                Err(e) => {
                    warn!(
                        "{}: shard {} store {} unavailable: {}",
                        self.name, shard.index, ip, e
                    );
                    shard.current_ip = (shard.current_ip + 1) % count;
                }
            }
        }
        None
    }

    /// Drop `conn` from the pool if it is still the pooled one
    pub fn remove(&self, conn: &Arc<Connection>) -> bool {
        let mut conns = self.conns.lock();
        match conns.get(conn.peer()) {
            Some(pooled) if Arc::ptr_eq(pooled, conn) => {
                conns.remove(conn.peer());
                true
            }
            _ => false,
        }
    }

    /// Close and drop every pooled connection
    pub fn close_all(&self) {
        let conns = std::mem::take(&mut *self.conns.lock());
        for conn in conns.into_values() {
            conn.close();
        }
    }

    /// Evict dead connections, then heartbeat a bounded batch of live ones
    ///
    /// A connection is evicted when it is not OK or has more than
    /// `max_outstanding` unanswered heartbeats. At most `max_batch`
    /// heartbeats are sent, starting at `cursor`, which is left pointing
    /// after the last connection visited.
    pub fn sweep_heartbeats(
        &self,
        cursor: &mut usize,
        max_batch: usize,
        max_outstanding: u32,
        mut send: impl FnMut(&Arc<Connection>) -> bool,
    ) -> HeartbeatSweep {
        let mut evicted = Vec::new();
        let live: Vec<Arc<Connection>> = {
            let mut conns = self.conns.lock();
            conns.retain(|_, c| {
                let keep = c.is_ok() && c.inflight_heartbeats() <= max_outstanding;
                if !keep {
                    evicted.push(Arc::clone(c));
                }
                keep
            });
            conns.values().cloned().collect()
        };

        let mut sweep = HeartbeatSweep {
            evicted: evicted.len(),
            sent: 0,
        };
        for conn in evicted {
            warn!(
                "{}: evicting {} (state {:?}, {} heartbeats outstanding)",
                self.name,
                conn,
                conn.state(),
                conn.inflight_heartbeats()
            );
            conn.close();
        }

        if live.is_empty() {
            *cursor = 0;
            return sweep;
        }
        *cursor %= live.len();
        let visits = max_batch.min(live.len());
        for i in 0..visits {
            let conn = &live[(*cursor + i) % live.len()];
            if send(conn) {
                conn.heartbeat_sent();
                sweep.sent += 1;
            }
        }
        *cursor = (*cursor + visits) % live.len();
        sweep
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close_all();
    }
}
