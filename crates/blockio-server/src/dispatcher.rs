//! Store-side request dispatch and subtask join
//!
//! ```text
//!  poller ── IoRequest ──▶ ┌────────────┐ ── SubTaskHandle ──▶ local engine
//!                          │ dispatcher │ ── SubTaskHandle ──▶ forwarder ──▶ peer store
//!  engine/forwarder ─────▶ │  (worker)  │
//!      SubtaskDone         └────────────┘ ── one reply ──▶ client
//! ```
//!
//! The dispatcher holds one reference on the iocb while it fans out and each
//! dispatched subtask holds another. Subtask results are folded on the
//! dispatcher thread, so the fold itself needs no atomics; the reference
//! count decides which release sends the reply.

use crate::iocb::{ServerIocb, SubTask, SubTaskHandle};
use crate::replica::{Replica, ServerVolume};
use blockio_common::{
    HealthStatus, MAX_IO_SIZE, MessageHead, MessageStatus, ObjectPool, OpCode, PoolRef,
    is_sector_aligned, shard_index,
};
use blockio_event::{Event, EventHandler, EventKind, EventPoster};
use blockio_transport::{BdRef, Connection, WireMessage};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

pub enum ServerEvent {
    /// A command arrived in `bd`
    IoRequest { bd: BdRef, conn: Arc<Connection> },
    SubtaskDone {
        iocb: PoolRef<ServerIocb>,
        rep_index: u8,
        status: MessageStatus,
        meta_ver: u16,
        data: Option<Bytes>,
    },
    ConnClosed(Arc<Connection>),
}

impl Event for ServerEvent {
    fn kind(&self) -> EventKind {
        match self {
            Self::IoRequest { .. } => EventKind::IoRequest,
            Self::SubtaskDone { .. } => EventKind::IoComplete,
            Self::ConnClosed(_) => EventKind::ConnClosed,
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub requests: AtomicU64,
    pub replies: AtomicU64,
    pub subtasks: AtomicU64,
    pub media_errors: AtomicU64,
    /// Requests answered without dispatch (invalid, stale or no resource)
    pub rejected: AtomicU64,
}

pub struct Dispatcher {
    name: String,
    poster: EventPoster<Self>,
    iocbs: ObjectPool<ServerIocb>,
    volumes: HashMap<u64, ServerVolume>,
    stats: Arc<DispatcherStats>,
}

impl Dispatcher {
    pub fn new(name: impl Into<String>, poster: EventPoster<Self>, io_depth: usize) -> Self {
        let name = name.into();
        Self {
            iocbs: ObjectPool::new(format!("{name}-iocb"), io_depth, |_| ServerIocb::default()),
            name,
            poster,
            volumes: HashMap::new(),
            stats: Arc::new(DispatcherStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<DispatcherStats> {
        Arc::clone(&self.stats)
    }

    #[must_use]
    pub fn free_iocbs(&self) -> usize {
        self.iocbs.remaining()
    }

    #[must_use]
    pub fn iocb_capacity(&self) -> usize {
        self.iocbs.capacity()
    }

    /// References still held on iocb slots, summed over the pool
    #[must_use]
    pub fn held_iocb_refs(&self) -> u64 {
        (0..self.iocbs.capacity())
            .filter_map(|i| self.iocbs.ref_count_of(i))
            .map(u64::from)
            .sum()
    }

    pub fn add_volume(&mut self, volume: ServerVolume) {
        info!(
            "{}: serving volume {} ({} shards, meta_ver {})",
            self.name,
            volume.volume_id,
            volume.shards.len(),
            volume.meta_ver
        );
        self.volumes.insert(volume.volume_id, volume);
    }

    pub fn remove_volume(&mut self, volume_id: u64) -> bool {
        self.volumes.remove(&volume_id).is_some()
    }

    pub fn set_meta_ver(&mut self, volume_id: u64, meta_ver: u16) -> bool {
        self.volumes
            .get_mut(&volume_id)
            .map(|v| v.meta_ver = meta_ver)
            .is_some()
    }

    pub fn set_replica_status(
        &mut self,
        volume_id: u64,
        shard: usize,
        rep_index: u8,
        status: HealthStatus,
    ) -> bool {
        self.volumes
            .get_mut(&volume_id)
            .is_some_and(|v| v.set_replica_status(shard, rep_index, status))
    }

    fn on_request(&mut self, bd: BdRef, conn: Arc<Connection>) {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let (head, payload) = {
            let b = bd.lock();
            let payload = (b.data_len > 0).then(|| Bytes::copy_from_slice(b.payload()));
            (b.head, payload)
        };

        if head.opcode == OpCode::Heartbeat {
            let meta_ver = self.volumes.get(&head.volume_id).map_or(0, |v| v.meta_ver);
            self.send_reply(&conn, &head, MessageStatus::Success, meta_ver, None);
            repost(&conn, bd);
            return;
        }

        let (targets, meta_ver) = match self.eligible(&head, payload.as_ref()) {
            Ok(found) => found,
            Err((status, meta_ver)) => {
                debug!(
                    "{}: {} cid:{} seq:{} answered {}",
                    self.name, head.opcode, head.command_id, head.command_seq, status
                );
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                self.send_reply(&conn, &head, status, meta_ver, None);
                repost(&conn, bd);
                return;
            }
        };

        let Some(iocb) = self.iocbs.alloc() else {
            warn!("{}: iocb pool exhausted", self.name);
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            self.send_reply(&conn, &head, MessageStatus::NoResource, meta_ver, None);
            repost(&conn, bd);
            return;
        };

        let dispatched: Vec<Replica> = {
            let mut io = iocb.lock();
            io.cmd_bd = Some(bd);
            io.conn = Some(conn);
            io.volume_id = head.volume_id;
            io.data.clone_from(&payload);
            io.complete_meta_ver = meta_ver;
            targets
                .into_iter()
                .filter(|r| io.add_subtask(SubTask::new(head.opcode, r.rep_index)))
                .collect()
        };
        if dispatched.is_empty() {
            iocb.lock().status = MessageStatus::NoReplica;
        }

        for replica in dispatched {
            self.stats.subtasks.fetch_add(1, Ordering::Relaxed);
            let handle =
                SubTaskHandle::new(iocb.add_ref(), replica.rep_index, meta_ver, self.poster.clone());
            debug!(
                "{}: cid:{} replica {} -> {}",
                self.name,
                head.command_id,
                replica.rep_index,
                replica.backend.describe()
            );
            replica.backend.submit(&head, payload.clone(), handle);
        }
        self.release(iocb);
    }

    /// Validate the command and pick the replicas it fans out to
    fn eligible(
        &self,
        head: &MessageHead,
        payload: Option<&Bytes>,
    ) -> Result<(Vec<Replica>, u16), (MessageStatus, u16)> {
        let Some(volume) = self.volumes.get(&head.volume_id) else {
            return Err((MessageStatus::InvalidField, 0));
        };
        let meta_ver = volume.meta_ver;
        if head.meta_ver != meta_ver {
            return Err((MessageStatus::Reopen, meta_ver));
        }

        let length = u64::from(head.length);
        let in_range = head.offset.checked_add(length).is_some_and(|end| {
            end <= volume.size && shard_index(end - 1) == shard_index(head.offset)
        });
        if length == 0
            || head.length as usize > MAX_IO_SIZE
            || !is_sector_aligned(head.offset, length)
            || !in_range
        {
            return Err((MessageStatus::InvalidField, meta_ver));
        }
        if head.opcode.carries_payload() && payload.map_or(0, Bytes::len) != head.length as usize {
            return Err((MessageStatus::InvalidField, meta_ver));
        }
        let Some(shard) = volume.shards.get(shard_index(head.offset)) else {
            return Err((MessageStatus::InvalidField, meta_ver));
        };

        let replicas = shard.replicas.iter();
        let targets: Vec<Replica> = match head.opcode {
            OpCode::Read => replicas
                .filter(|r| r.backend.is_local() && r.status == HealthStatus::Ok)
                .take(1)
                .cloned()
                .collect(),
            OpCode::Write => replicas
                .filter(|r| r.status.accepts_writes())
                .cloned()
                .collect(),
            OpCode::ReplicateWrite => replicas
                .filter(|r| {
                    r.rep_index == head.rep_index
                        && r.backend.is_local()
                        && r.status.accepts_writes()
                })
                .cloned()
                .collect(),
            OpCode::Heartbeat => return Err((MessageStatus::InvalidOp, meta_ver)),
        };
        if targets.is_empty() {
            warn!(
                "{}: no eligible replica for {} on volume {} shard {}",
                self.name, head.opcode, head.volume_id, shard.index
            );
            return Err((MessageStatus::NoReplica, meta_ver));
        }
        Ok((targets, meta_ver))
    }

    fn on_subtask_done(
        &mut self,
        iocb: PoolRef<ServerIocb>,
        rep_index: u8,
        status: MessageStatus,
        meta_ver: u16,
        data: Option<Bytes>,
    ) {
        if status == MessageStatus::MediaError {
            self.stats.media_errors.fetch_add(1, Ordering::Relaxed);
        }
        let folded = {
            let mut io = iocb.lock();
            let folded = io.fold(rep_index, status, meta_ver);
            if folded && status.is_success() && data.is_some() {
                io.read_data = data;
            }
            folded
        };
        if !folded {
            warn!(
                "{}: completion of replica {} on iocb {} was not outstanding",
                self.name,
                rep_index,
                iocb.index()
            );
        }
        self.release(iocb);
    }

    /// Drop one reference; the last one replies and recycles the iocb
    fn release(&self, iocb: PoolRef<ServerIocb>) {
        let Some(last) = iocb.release() else {
            return;
        };
        let (head, conn, bd, status, meta_ver, data) = {
            let mut io = last.lock();
            let head = io.head();
            let data = if head.opcode == OpCode::Read && io.status.is_success() {
                io.read_data.take()
            } else {
                None
            };
            (
                head,
                io.conn.take(),
                io.cmd_bd.take(),
                io.status,
                io.complete_meta_ver,
                data,
            )
        };
        if let Some(conn) = conn {
            self.send_reply(&conn, &head, status, meta_ver, data);
            if let Some(bd) = bd {
                repost(&conn, bd);
            }
        }
        drop(last);
    }

    fn send_reply(
        &self,
        conn: &Connection,
        head: &MessageHead,
        status: MessageStatus,
        meta_ver: u16,
        data: Option<Bytes>,
    ) {
        self.stats.replies.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = conn.post_send(WireMessage::reply(head.reply(status, meta_ver), data)) {
            debug!(
                "{}: reply cid:{} seq:{} not sent: {}",
                self.name, head.command_id, head.command_seq, e
            );
        }
    }
}

/// Hand a command buffer back to its connection for the next receive
fn repost(conn: &Connection, bd: BdRef) {
    if let Err(e) = conn.post_recv(bd) {
        debug!("{}: command buffer not reposted: {}", conn, e);
    }
}

impl EventHandler for Dispatcher {
    type Event = ServerEvent;

    fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::IoRequest { bd, conn } => self.on_request(bd, conn),
            ServerEvent::SubtaskDone {
                iocb,
                rep_index,
                status,
                meta_ver,
                data,
            } => self.on_subtask_done(iocb, rep_index, status, meta_ver, data),
            ServerEvent::ConnClosed(conn) => {
                info!("{}: {} closed", self.name, conn);
            }
        }
    }

    fn on_discard(&mut self, event: ServerEvent) {
        match event {
            // finish the join so the parent still replies once
            ServerEvent::SubtaskDone {
                iocb,
                rep_index,
                status,
                meta_ver,
                data,
            } => self.on_subtask_done(iocb, rep_index, status, meta_ver, data),
            ServerEvent::IoRequest { bd, conn } => {
                let head = bd.lock().head;
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                self.send_reply(&conn, &head, MessageStatus::NoResource, head.meta_ver, None);
            }
            ServerEvent::ConnClosed(_) => {}
        }
    }

    fn on_exit(&mut self) {
        let busy = self.iocbs.capacity() - self.iocbs.remaining();
        if busy > 0 {
            warn!("{}: exiting with {} requests in flight", self.name, busy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{ReplicaBackend, Shard};
    use blockio_common::config::QueueConfig;
    use blockio_common::{MessageReply, Result};
    use blockio_event::EventWorker;
    use blockio_transport::{
        BufferKind, BufferPool, CompletionHandler, Link, WcStatus, buffer_pool,
    };
    use parking_lot::Mutex;
    use rand::Rng;
    use rand::seq::SliceRandom;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct ReplyLog {
        replies: Mutex<Vec<(MessageReply, Option<Bytes>)>>,
    }

    struct LogLink(Arc<ReplyLog>);

    impl Link for LogLink {
        fn send(&self, msg: WireMessage) -> Result<()> {
            if let WireMessage::Reply { reply, data } = msg {
                self.0.replies.lock().push((reply, data));
            }
            Ok(())
        }

        fn close(&self) {}
    }

    struct Ignore;

    impl CompletionHandler for Ignore {
        fn on_work_complete(&self, _bd: BdRef, _status: WcStatus, _conn: &Arc<Connection>) {}
    }

    /// Completes every subtask with a fixed status after a random delay
    struct Scripted {
        status: MessageStatus,
        max_delay_ms: u64,
    }

    impl ReplicaBackend for Scripted {
        fn submit(&self, _head: &MessageHead, _data: Option<Bytes>, handle: SubTaskHandle) {
            let status = self.status;
            let delay = rand::thread_rng().gen_range(0..=self.max_delay_ms);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(delay));
                handle.complete(status, None);
            });
        }

        fn is_local(&self) -> bool {
            true
        }

        fn describe(&self) -> String {
            format!("scripted:{}", self.status)
        }
    }

    /// Never completes; the handle is dropped at once
    struct Leaky;

    impl ReplicaBackend for Leaky {
        fn submit(&self, _head: &MessageHead, _data: Option<Bytes>, handle: SubTaskHandle) {
            drop(handle);
        }

        fn is_local(&self) -> bool {
            true
        }

        fn describe(&self) -> String {
            "leaky".into()
        }
    }

    /// Keeps every handle for the test to complete by hand
    #[derive(Default)]
    struct Holding {
        handles: Arc<Mutex<Vec<SubTaskHandle>>>,
    }

    impl ReplicaBackend for Holding {
        fn submit(&self, _head: &MessageHead, _data: Option<Bytes>, handle: SubTaskHandle) {
            self.handles.lock().push(handle);
        }

        fn is_local(&self) -> bool {
            true
        }

        fn describe(&self) -> String {
            "holding".into()
        }
    }

    struct Harness {
        worker: EventWorker<Dispatcher>,
        poster: EventPoster<Dispatcher>,
        log: Arc<ReplyLog>,
        conn: Arc<Connection>,
        cmds: BufferPool,
    }

    impl Harness {
        fn new(depth: usize, replicas: Vec<Replica>) -> Self {
            Self::with_queue(depth, replicas, &QueueConfig::default())
        }

        fn with_queue(depth: usize, replicas: Vec<Replica>, queue: &QueueConfig) -> Self {
            let mut worker = EventWorker::new("disp-test", queue);
            let poster = worker.poster();
            let mut dispatcher = Dispatcher::new("disp-test", poster.clone(), depth);
            dispatcher.add_volume(ServerVolume {
                volume_id: 9,
                size: 1 << 20,
                meta_ver: 3,
                shards: vec![Shard { index: 0, replicas }],
            });
            worker.start(dispatcher).unwrap();
            let log = Arc::new(ReplyLog::default());
            let link = LogLink(Arc::clone(&log));
            let conn = Arc::new(Connection::new(1, "client", Box::new(link), Arc::new(Ignore)));
            conn.mark_ready();
            Self {
                worker,
                poster,
                log,
                conn,
                cmds: buffer_pool("cmds", BufferKind::Command, 64, MAX_IO_SIZE),
            }
        }

        fn send(&self, head: MessageHead, payload: &[u8]) {
            let bd = self.cmds.alloc().unwrap();
            {
                let mut b = bd.lock();
                b.head = head;
                b.set_payload(payload).unwrap();
            }
            let conn = Arc::clone(&self.conn);
            self.poster.post(ServerEvent::IoRequest { bd, conn }).unwrap();
        }

        fn wait_replies(&self, n: usize) -> Vec<(MessageReply, Option<Bytes>)> {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.log.replies.lock().len() < n && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(2));
            }
            self.log.replies.lock().clone()
        }

        fn free_iocbs(&self) -> usize {
            self.poster.sync_invoke(|d: &mut Dispatcher| d.free_iocbs()).unwrap()
        }
    }

    fn replica(rep_index: u8, status: MessageStatus) -> Replica {
        Replica {
            rep_index,
            status: HealthStatus::Ok,
            backend: Arc::new(Scripted {
                status,
                max_delay_ms: 5,
            }),
        }
    }

    fn write_head(command_id: u16) -> MessageHead {
        let mut head = MessageHead::new(OpCode::Write, command_id);
        head.command_seq = 1;
        head.volume_id = 9;
        head.meta_ver = 3;
        head.length = 4096;
        head
    }

    #[test]
    fn test_fan_out_first_failure_wins() {
        let mut rng = rand::thread_rng();
        for round in 0..20u16 {
            let mut statuses = [
                MessageStatus::Success,
                MessageStatus::MediaError,
                MessageStatus::Success,
            ];
            statuses.shuffle(&mut rng);
            let replicas = statuses
                .iter()
                .enumerate()
                .map(|(i, s)| replica(i as u8, *s))
                .collect();
            let h = Harness::new(4, replicas);
            h.send(write_head(round), &[7u8; 4096]);

            let replies = h.wait_replies(1);
            assert_eq!(replies.len(), 1);
            assert_eq!(replies[0].0.status, MessageStatus::MediaError);
            assert_eq!(replies[0].0.command_id, round);
            // no late second reply
            std::thread::sleep(Duration::from_millis(20));
            assert_eq!(h.log.replies.lock().len(), 1);
            assert_eq!(h.free_iocbs(), 4);
        }
    }

    #[test]
    fn test_all_success_replies_once_and_recycles() {
        let h = Harness::new(8, (0..3).map(|i| replica(i, MessageStatus::Success)).collect());
        for cid in 0..8 {
            h.send(write_head(cid), &[1u8; 4096]);
        }
        let replies = h.wait_replies(8);
        assert_eq!(replies.len(), 8);
        assert!(replies.iter().all(|(r, _)| r.status.is_success() && r.meta_ver == 3));
        let stats = h.poster.sync_invoke(|d: &mut Dispatcher| d.stats()).unwrap();
        assert_eq!(stats.subtasks.load(Ordering::Relaxed), 24);
        assert_eq!(h.free_iocbs(), 8);
        // every command buffer went back to the connection
        assert_eq!(h.conn.posted_recvs(), 8);
    }

    #[test]
    fn test_zero_eligible_replies_no_replica() {
        let unhealthy = [HealthStatus::Error, HealthStatus::Offline, HealthStatus::Error];
        let replicas = unhealthy
            .iter()
            .enumerate()
            .map(|(i, status)| Replica {
                status: *status,
                ..replica(i as u8, MessageStatus::Success)
            })
            .collect();
        let h = Harness::new(4, replicas);
        h.send(write_head(1), &[0u8; 4096]);
        let replies = h.wait_replies(1);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0.status, MessageStatus::NoReplica);
        assert_eq!(h.free_iocbs(), 4);
    }

    #[test]
    fn test_recovering_replica_takes_writes() {
        let h = Harness::new(4, (0..2).map(|i| replica(i, MessageStatus::Success)).collect());
        let changed = h
            .poster
            .sync_invoke(|d: &mut Dispatcher| {
                d.set_replica_status(9, 0, 1, HealthStatus::Recovering)
                    && d.set_replica_status(9, 0, 0, HealthStatus::Offline)
            })
            .unwrap();
        assert!(changed);
        h.send(write_head(1), &[0u8; 4096]);
        let replies = h.wait_replies(1);
        assert_eq!(replies[0].0.status, MessageStatus::Success);
        let stats = h.poster.sync_invoke(|d: &mut Dispatcher| d.stats()).unwrap();
        assert_eq!(stats.subtasks.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stale_meta_ver_asks_for_reopen() {
        let h = Harness::new(4, vec![replica(0, MessageStatus::Success)]);
        let mut head = write_head(5);
        head.meta_ver = 2;
        h.send(head, &[0u8; 4096]);
        let replies = h.wait_replies(1);
        assert_eq!(replies[0].0.status, MessageStatus::Reopen);
        assert_eq!(replies[0].0.meta_ver, 3);
    }

    #[test]
    fn test_invalid_requests_rejected() {
        let h = Harness::new(4, vec![replica(0, MessageStatus::Success)]);
        let mut unknown = write_head(1);
        unknown.volume_id = 77;
        h.send(unknown, &[0u8; 4096]);
        let mut misaligned = write_head(2);
        misaligned.offset = 100;
        h.send(misaligned, &[0u8; 4096]);
        let mut beyond = write_head(3);
        beyond.offset = 1 << 20;
        h.send(beyond, &[0u8; 4096]);
        h.send(write_head(4), &[0u8; 512]);

        let replies = h.wait_replies(4);
        assert_eq!(replies.len(), 4);
        assert!(replies.iter().all(|(r, _)| r.status == MessageStatus::InvalidField));
    }

    #[test]
    fn test_exhausted_pool_replies_no_resource() {
        let h = Harness::new(1, vec![replica(0, MessageStatus::Success)]);
        // leak the only iocb
        h.poster
            .sync_invoke(|d: &mut Dispatcher| {
                let held = d.iocbs.alloc();
                assert!(held.is_some());
                std::mem::forget(held);
            })
            .unwrap();
        h.send(write_head(1), &[0u8; 4096]);
        let replies = h.wait_replies(1);
        assert_eq!(replies[0].0.status, MessageStatus::NoResource);
        assert_eq!(h.free_iocbs(), 0);
        assert_eq!(h.conn.posted_recvs(), 1);
    }

    #[test]
    fn test_dropped_handle_fails_subtask() {
        let leaky = Replica {
            rep_index: 1,
            status: HealthStatus::Ok,
            backend: Arc::new(Leaky),
        };
        let h = Harness::new(2, vec![replica(0, MessageStatus::Success), leaky]);
        h.send(write_head(1), &[0u8; 4096]);
        let replies = h.wait_replies(1);
        assert_eq!(replies[0].0.status, MessageStatus::MediaError);
        assert_eq!(h.free_iocbs(), 2);
    }

    #[test]
    fn test_heartbeat_answered_inline() {
        let h = Harness::new(1, vec![replica(0, MessageStatus::Success)]);
        let mut head = MessageHead::new(OpCode::Heartbeat, 11);
        head.volume_id = 9;
        h.send(head, &[]);
        let replies = h.wait_replies(1);
        assert_eq!(replies[0].0.status, MessageStatus::Success);
        assert_eq!(replies[0].0.meta_ver, 3);
    }

    #[test]
    fn test_completion_behind_full_queue_still_replies() {
        let backend = Holding::default();
        let handles = Arc::clone(&backend.handles);
        let replicas = vec![Replica {
            rep_index: 0,
            status: HealthStatus::Ok,
            backend: Arc::new(backend),
        }];
        let queue = QueueConfig {
            depth: 2,
            ..QueueConfig::default()
        };
        let h = Harness::with_queue(2, replicas, &queue);
        h.send(write_head(1), &[3u8; 4096]);
        let deadline = Instant::now() + Duration::from_secs(5);
        while handles.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        let handle = handles.lock().pop().unwrap();

        // park the worker inside a call, then fill its queue
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(1);
        let blocker = {
            let poster = h.poster.clone();
            std::thread::spawn(move || {
                poster.sync_invoke(move |_d: &mut Dispatcher| {
                    entered_tx.send(()).unwrap();
                    gate_rx.recv().unwrap();
                })
            })
        };
        entered_rx.recv().unwrap();
        while h
            .poster
            .post(ServerEvent::ConnClosed(Arc::clone(&h.conn)))
            .is_ok()
        {}

        handle.complete(MessageStatus::Success, None);
        assert_eq!(h.worker.stats().deferred.load(Ordering::Relaxed), 1);
        assert!(h.log.replies.lock().is_empty());

        gate_tx.send(()).unwrap();
        blocker.join().unwrap().unwrap();
        let replies = h.wait_replies(1);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0.status, MessageStatus::Success);
        assert_eq!(h.free_iocbs(), 2);
        assert_eq!(h.conn.posted_recvs(), 1);
    }
}
