//! Volume event processor
//!
//! Runs on the volume's worker thread and owns everything that changes
//! while requests are in flight: the shard routes, the connection pool and
//! the map from command id to in-flight iocb.
//!
//! A reply is matched to its iocb by `(command_id, command_seq)`. The
//! sequence is advanced whenever a request is resent after a timeout, so a
//! late reply to the earlier send is discarded rather than completing the
//! request twice.

use crate::event::ClientEvent;
use crate::iocb::{ClientIocb, IoTimer};
use crate::meta::{MetadataService, VolumeInfo};
use crate::volume::{VolumeShared, VolumeStats};
use blockio_common::config::ClientConfig;
use blockio_common::time::{elapsed_since, now_usec};
use blockio_common::{
    Error, MessageStatus, OpCode, PoolRef, Result, VolumeState, shard_index,
};
use blockio_event::{EventHandler, EventPoster};
use blockio_transport::{
    BdRef, BufferPool, Connection, ConnectionPool, ShardRoute, WcStatus, WireMessage,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Routing state derived from one `open_volume` answer
#[derive(Debug, Clone)]
pub(crate) struct VolumeLayout {
    pub volume_id: u64,
    pub meta_ver: u16,
    pub snap_seq: u32,
    pub routes: Vec<ShardRoute>,
}

impl VolumeLayout {
    pub fn from_info(info: &VolumeInfo) -> Result<Self> {
        Ok(Self {
            volume_id: info.volume_id,
            meta_ver: info.meta_ver,
            snap_seq: info.snap_seq,
            routes: info.routes()?,
        })
    }
}

pub(crate) struct VolumeProcessor {
    shared: Arc<VolumeShared>,
    poster: EventPoster<Self>,
    meta: Arc<dyn MetadataService>,
    config: ClientConfig,
    layout: VolumeLayout,
    conns: ConnectionPool,
    reply_pool: BufferPool,
    inflight: HashMap<u16, PoolRef<ClientIocb>>,
    heartbeat_cursor: usize,
}

impl VolumeProcessor {
    pub fn new(
        shared: Arc<VolumeShared>,
        poster: EventPoster<Self>,
        meta: Arc<dyn MetadataService>,
        config: ClientConfig,
        layout: VolumeLayout,
        conns: ConnectionPool,
        reply_pool: BufferPool,
    ) -> Self {
        Self {
            shared,
            poster,
            meta,
            config,
            layout,
            conns,
            reply_pool,
            inflight: HashMap::new(),
            heartbeat_cursor: 0,
        }
    }

    pub const fn meta_ver(&self) -> u16 {
        self.layout.meta_ver
    }

    fn dispatch(&mut self, iocb: PoolRef<ClientIocb>) {
        let state = self.shared.state();
        if state != VolumeState::Opened {
            self.finish(iocb, Err(Error::VolumeState(state)));
            return;
        }

        let head = iocb.lock().head();
        let shard = shard_index(head.offset);
        let Some(route) = self.layout.routes.get_mut(shard) else {
            let size = self.shared.volume_size();
            self.finish(
                iocb,
                Err(Error::OutOfRange {
                    offset: head.offset,
                    length: u64::from(head.length),
                    size,
                }),
            );
            return;
        };
        let Some(conn) = self.conns.get_shard_conn(route) else {
            error!(
                "Volume {}: no store of shard {} reachable",
                self.shared.name, shard
            );
            self.shared.set_state(VolumeState::Disconnected);
            self.finish(iocb, Err(Error::NoConnection { shard }));
            return;
        };

        let layout = &self.layout;
        iocb.lock().update_head(|h| {
            h.volume_id = layout.volume_id;
            h.meta_ver = layout.meta_ver;
            h.snap_seq = layout.snap_seq;
        });
        if let Err((iocb, e)) = post_command(
            &conn,
            iocb,
            &self.reply_pool,
            &self.shared.timers,
            &mut self.inflight,
        ) {
            warn!(
                "Volume {}: failed to send cid:{} to {}: {}",
                self.shared.name, head.command_id, conn, e
            );
            self.finish(iocb, Err(Error::TryAgain));
        }
    }

    fn on_complete(&mut self, bd: BdRef, status: WcStatus, conn: &Arc<Connection>) {
        if status != WcStatus::Success {
            debug!("Volume {}: {:?} on {}", self.shared.name, status, conn);
            drop(bd);
            conn.close();
            return;
        }

        let (reply, data) = {
            let b = bd.lock();
            (b.reply, Bytes::copy_from_slice(b.payload()))
        };
        drop(bd);

        let cid = reply.command_id;
        let current = self.inflight.get(&cid).map(|io| io.lock().head());
        let Some(head) = current.filter(|h| h.command_seq == reply.command_seq) else {
            warn!(
                "Volume {}: discarding stale reply cid:{} seq:{} from {}",
                self.shared.name, cid, reply.command_seq, conn
            );
            VolumeStats::bump(&self.shared.stats.stale_replies);
            return;
        };
        let Some(iocb) = self.inflight.remove(&cid) else {
            return;
        };
        if let Some(timer) = self.shared.timers.get(usize::from(cid)) {
            timer.disarm();
        }

        if reply.status == MessageStatus::Reopen {
            warn!(
                "Volume {}: {} asks to reopen, store meta_ver {} local {}",
                self.shared.name, conn, reply.meta_ver, self.layout.meta_ver
            );
            if reply.meta_ver > self.layout.meta_ver {
                self.request_reopen(reply.meta_ver);
            }
            iocb.lock().conn = None;
            self.repost(iocb);
            return;
        }

        if head.opcode == OpCode::Heartbeat {
            conn.heartbeat_answered();
            return;
        }

        let submit_time = iocb.lock().submit_time;
        let elapsed = elapsed_since(submit_time);
        if elapsed.as_millis() > u128::from(self.config.slow_io_threshold_ms) {
            warn!(
                "Volume {}: SLOW IO {} cid:{} offset:{} length:{} took {} ms on {}",
                self.shared.name,
                head.opcode,
                cid,
                head.offset,
                head.length,
                elapsed.as_millis(),
                conn
            );
        }

        let result = if reply.status.is_success() {
            Ok((head.opcode == OpCode::Read).then_some(data))
        } else {
            error!(
                "Volume {}: {} cid:{} offset:{} failed on {}: {}",
                self.shared.name, head.opcode, cid, head.offset, conn, reply.status
            );
            Err(Error::from(reply.status))
        };
        self.finish(iocb, result);
    }

    fn on_timeout(&mut self, cid: u16) {
        let Some(timer) = self.shared.timers.get(usize::from(cid)) else {
            return;
        };
        if !self.inflight.contains_key(&cid) || !timer.is_expired(self.config.io_timeout()) {
            // answered or resent since the scanner looked
            timer.clear_flag();
            return;
        }
        let Some(iocb) = self.inflight.remove(&cid) else {
            return;
        };
        timer.disarm();
        VolumeStats::bump(&self.shared.stats.timeouts);

        let (head, conn) = {
            let mut io = iocb.lock();
            (io.head(), io.conn.take())
        };
        let peer = conn.as_ref().map_or_else(|| "-".to_string(), ToString::to_string);

        if head.opcode == OpCode::Heartbeat {
            error!("Volume {}: heartbeat timeout on {}", self.shared.name, peer);
            return;
        }

        warn!(
            "Volume {}: {} cid:{} seq:{} offset:{} timed out on {}",
            self.shared.name, head.opcode, cid, head.command_seq, head.offset, peer
        );
        if let Some(conn) = conn {
            conn.close();
        }

        let state = self.shared.state();
        if state != VolumeState::Opened {
            self.finish(iocb, Err(Error::Timeout));
            return;
        }
        iocb.lock().bump_seq();
        VolumeStats::bump(&self.shared.stats.resent);
        self.repost(iocb);
    }

    fn on_reopen(&mut self, meta_ver: u16, requested_at: u64) {
        if requested_at <= self.shared.open_time() {
            debug!(
                "Volume {}: reopen for meta_ver {} already satisfied",
                self.shared.name, meta_ver
            );
            return;
        }
        VolumeStats::bump(&self.shared.stats.reopens);
        info!(
            "Reopening volume {} (local meta_ver {}, requested {})",
            self.shared.name, self.layout.meta_ver, meta_ver
        );
        self.shared.set_state(VolumeState::Disconnected);

        let opened = self
            .meta
            .open_volume(&self.shared.name, self.shared.snapshot.as_deref())
            .and_then(|info| Ok((info.volume_size, VolumeLayout::from_info(&info)?)));
        match opened {
            Ok((size, layout)) => {
                info!(
                    "Volume {} reopened, meta_ver {} -> {}",
                    self.shared.name, self.layout.meta_ver, layout.meta_ver
                );
                self.layout = layout;
                self.shared.set_volume_size(size);
                self.shared.set_open_time(now_usec());
                self.shared.set_state(VolumeState::Opened);
            }
            Err(e) => {
                error!("Failed to reopen volume {}: {}", self.shared.name, e);
                self.shared.set_state(VolumeState::ReopenFail);
            }
        }
    }

    fn on_reconnect(&mut self) {
        let state = self.shared.state();
        if !state.can_reconnect() || !self.shared.is_idle() {
            debug!(
                "Volume {}: reconnect skipped in state {} with {} iocbs busy",
                self.shared.name,
                state,
                self.shared.iocbs.capacity() - self.shared.iocbs.remaining()
            );
            return;
        }
        warn!("Volume {}: reconnecting from {}", self.shared.name, state);
        self.conns.close_all();
        self.request_reopen(self.layout.meta_ver);
    }

    fn send_heartbeats(&mut self) {
        let Self {
            shared,
            layout,
            conns,
            reply_pool,
            inflight,
            heartbeat_cursor,
            config,
            ..
        } = self;
        let sweep = conns.sweep_heartbeats(
            heartbeat_cursor,
            config.heartbeat_batch,
            config.max_outstanding_heartbeats,
            |conn| {
                let Some(iocb) = shared.iocbs.alloc() else {
                    return false;
                };
                {
                    let io = iocb.lock();
                    io.update_head(|h| {
                        h.opcode = OpCode::Heartbeat;
                        h.offset = 0;
                        h.length = 0;
                        h.volume_id = layout.volume_id;
                        h.meta_ver = layout.meta_ver;
                    });
                    io.bump_seq();
                }
                post_command(conn, iocb, reply_pool, &shared.timers, inflight).is_ok()
            },
        );
        if sweep.evicted > 0 || sweep.sent > 0 {
            debug!(
                "Volume {}: heartbeat sweep sent {} evicted {}",
                shared.name, sweep.sent, sweep.evicted
            );
        }
        shared
            .stats
            .heartbeats_sent
            .fetch_add(sweep.sent as u64, std::sync::atomic::Ordering::Relaxed);
    }

    fn request_reopen(&self, meta_ver: u16) {
        let event = ClientEvent::Reopen {
            meta_ver,
            requested_at: now_usec(),
        };
        if let Err(r) = self.poster.post(event) {
            warn!("Volume {}: reopen not queued: {}", self.shared.name, r.reason);
        }
    }

    fn repost(&mut self, iocb: PoolRef<ClientIocb>) {
        if let Err(r) = self.poster.post(ClientEvent::IoRequest(iocb)) {
            let (err, event) = r.into_parts();
            if let ClientEvent::IoRequest(iocb) = event {
                self.finish(iocb, Err(err));
            }
        }
    }

    /// Return the iocb to the pool, then run its callback
    fn finish(&mut self, iocb: PoolRef<ClientIocb>, result: Result<Option<Bytes>>) {
        if let Some(timer) = self.shared.timers.get(iocb.index()) {
            timer.disarm();
        }
        let callback = {
            let mut io = iocb.lock();
            io.conn = None;
            io.reply_time = now_usec();
            io.callback.take()
        };
        let counter = if result.is_ok() {
            &self.shared.stats.completed
        } else {
            &self.shared.stats.failed
        };
        VolumeStats::bump(counter);
        drop(iocb);
        if let Some(callback) = callback {
            callback(result);
        }
    }
}

/// Post a reply receive, arm the slot's timer and send the command
///
/// On failure the iocb is handed back untracked.
fn post_command(
    conn: &Arc<Connection>,
    iocb: PoolRef<ClientIocb>,
    reply_pool: &BufferPool,
    timers: &[IoTimer],
    inflight: &mut HashMap<u16, PoolRef<ClientIocb>>,
) -> std::result::Result<(), (PoolRef<ClientIocb>, Error)> {
    let Some(reply_bd) = reply_pool.alloc() else {
        return Err((iocb, Error::TryAgain));
    };
    if let Err(e) = conn.post_recv(reply_bd) {
        return Err((iocb, e));
    }

    let (msg, cid) = {
        let mut io = iocb.lock();
        io.conn = Some(Arc::clone(conn));
        let head = io.head();
        let data = if head.opcode.carries_payload() {
            io.payload()
        } else {
            None
        };
        (WireMessage::request(head, data), head.command_id)
    };
    let Some(timer) = timers.get(usize::from(cid)) else {
        return Err((iocb, Error::internal(format!("command id {cid} has no timer"))));
    };

    timer.arm(now_usec());
    if let Err(e) = conn.post_send(msg) {
        timer.disarm();
        return Err((iocb, e));
    }
    inflight.insert(cid, iocb);
    Ok(())
}

impl EventHandler for VolumeProcessor {
    type Event = ClientEvent;

    fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::IoRequest(iocb) => self.dispatch(iocb),
            ClientEvent::IoComplete { bd, status, conn } => self.on_complete(bd, status, &conn),
            ClientEvent::IoTimeout { command_id } => self.on_timeout(command_id),
            ClientEvent::SendHeartbeat => self.send_heartbeats(),
            ClientEvent::Reopen {
                meta_ver,
                requested_at,
            } => self.on_reopen(meta_ver, requested_at),
            ClientEvent::Reconnect => self.on_reconnect(),
            ClientEvent::ConnClosed(conn) => {
                if self.conns.remove(&conn) {
                    debug!("Volume {}: dropped closed {}", self.shared.name, conn);
                }
            }
        }
    }

    fn on_discard(&mut self, event: ClientEvent) {
        if let ClientEvent::IoRequest(iocb) = event {
            self.finish(iocb, Err(Error::VolumeState(VolumeState::Closed)));
        }
    }

    fn on_exit(&mut self) {
        let pending: Vec<PoolRef<ClientIocb>> =
            self.inflight.drain().map(|(_, iocb)| iocb).collect();
        if !pending.is_empty() {
            info!(
                "Volume {}: failing {} in-flight requests on exit",
                self.shared.name,
                pending.len()
            );
        }
        for iocb in pending {
            self.finish(iocb, Err(Error::VolumeState(VolumeState::Closed)));
        }
        self.conns.close_all();
    }
}
