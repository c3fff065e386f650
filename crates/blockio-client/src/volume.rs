//! Client volume handle
//!
//! Callers may submit from any thread. Everything that touches the shard
//! table, the in-flight map or the connection pool runs on the volume's
//! worker thread; callbacks run there too and must not block on the
//! volume.

use crate::event::{ClientEvent, VolumeCompletion};
use crate::iocb::{ClientIocb, IoCallback, IoTimer};
use crate::meta::MetadataService;
use crate::processor::{VolumeLayout, VolumeProcessor};
use crate::scanner::TimeoutScanner;
use blockio_common::config::{ClientConfig, Config, QueueConfig};
use blockio_common::time::now_usec;
use blockio_common::{
    Error, MAX_IO_SIZE, ObjectPool, OpCode, Result, VolumeState, is_sector_aligned,
};
use blockio_event::{EventPoster, EventWorker};
use blockio_transport::{BufferKind, ConnectionPool, Transport, buffer_pool};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tracing::{info, warn};

/// Cumulative I/O counters of one volume
#[derive(Debug, Default)]
pub struct VolumeStats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub resent: AtomicU64,
    pub timeouts: AtomicU64,
    pub stale_replies: AtomicU64,
    pub reopens: AtomicU64,
    pub heartbeats_sent: AtomicU64,
}

impl VolumeStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State visible to submitters, the worker and the scanner alike
pub(crate) struct VolumeShared {
    pub name: String,
    pub snapshot: Option<String>,
    state: AtomicU8,
    open_time: AtomicU64,
    volume_size: AtomicU64,
    pub iocbs: ObjectPool<ClientIocb>,
    /// Indexed by command id
    pub timers: Box<[IoTimer]>,
    pub stats: VolumeStats,
}

impl VolumeShared {
    /// Build `depth` iocbs, each bound to its own command and data descriptor
    pub fn new(name: &str, snapshot: Option<&str>, volume_size: u64, depth: usize) -> Result<Self> {
        let cmd_pool = buffer_pool(&format!("{name}-cmd"), BufferKind::Command, depth, 0);
        let data_pool = buffer_pool(&format!("{name}-data"), BufferKind::Data, depth, MAX_IO_SIZE);
        let iocbs = ObjectPool::new(format!("{name}-iocb"), depth, |_| ClientIocb::default());
        for index in 0..depth {
            iocbs
                .with_slot(index, |io| io.prewarm(index, &cmd_pool, &data_pool))
                .ok_or_else(|| Error::internal(format!("iocb slot {index} missing")))??;
        }
        Ok(Self {
            name: name.to_string(),
            snapshot: snapshot.map(ToString::to_string),
            state: AtomicU8::new(VolumeState::Opened as u8),
            open_time: AtomicU64::new(now_usec()),
            volume_size: AtomicU64::new(volume_size),
            iocbs,
            timers: (0..depth).map(|_| IoTimer::default()).collect(),
            stats: VolumeStats::default(),
        })
    }

    pub fn state(&self) -> VolumeState {
        VolumeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: VolumeState) {
        let prev = VolumeState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if prev != state {
            info!("Volume {} state {} -> {}", self.name, prev, state);
        }
    }

    pub fn open_time(&self) -> u64 {
        self.open_time.load(Ordering::Acquire)
    }

    pub fn set_open_time(&self, usec: u64) {
        self.open_time.store(usec, Ordering::Release);
    }

    pub fn volume_size(&self) -> u64 {
        self.volume_size.load(Ordering::Acquire)
    }

    pub fn set_volume_size(&self, size: u64) {
        self.volume_size.store(size, Ordering::Release);
    }

    /// No request is in flight or queued
    pub fn is_idle(&self) -> bool {
        self.iocbs.remaining() == self.iocbs.capacity()
    }
}

/// Everything a volume needs from its environment
#[derive(Clone)]
pub struct ClientContext {
    pub config: ClientConfig,
    pub queue: QueueConfig,
    pub meta: Arc<dyn MetadataService>,
    pub transport: Arc<dyn Transport>,
}

impl ClientContext {
    pub fn new(
        config: &Config,
        meta: Arc<dyn MetadataService>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config: config.client.clone(),
            queue: config.queue.clone(),
            meta,
            transport,
        }
    }
}

/// What to do at an offset
#[derive(Debug, Clone, Copy)]
pub enum IoOp<'a> {
    Read(usize),
    Write(&'a [u8]),
}

impl IoOp<'_> {
    const fn opcode(&self) -> OpCode {
        match self {
            Self::Read(_) => OpCode::Read,
            Self::Write(_) => OpCode::Write,
        }
    }

    const fn len(&self) -> usize {
        match self {
            Self::Read(len) => *len,
            Self::Write(data) => data.len(),
        }
    }
}

/// An opened volume
pub struct ClientVolume {
    shared: Arc<VolumeShared>,
    poster: EventPoster<VolumeProcessor>,
    worker: Option<EventWorker<VolumeProcessor>>,
    scanner: Option<TimeoutScanner>,
}

impl ClientVolume {
    /// Look the volume up, pre-allocate its iocbs and start its threads
    pub fn open(volume: &str, snapshot: Option<&str>, ctx: &ClientContext) -> Result<Self> {
        let config = &ctx.config;
        if config.io_depth == 0 || config.io_depth > blockio_common::config::MAX_IO_DEPTH {
            return Err(Error::configuration(format!(
                "io_depth {} out of range",
                config.io_depth
            )));
        }

        let info = ctx.meta.open_volume(volume, snapshot)?;
        let layout = VolumeLayout::from_info(&info)?;
        info!(
            "Opening volume {} ({} bytes, {} shards, meta_ver {})",
            volume, info.volume_size, info.shard_count, info.meta_ver
        );

        let depth = config.io_depth;
        let shared = Arc::new(VolumeShared::new(volume, snapshot, info.volume_size, depth)?);
        let reply_pool = buffer_pool(&format!("{volume}-reply"), BufferKind::Reply, depth, MAX_IO_SIZE);
        // touch one reply descriptor so the pool is known to be usable
        drop(
            reply_pool
                .alloc()
                .ok_or_else(|| Error::internal("reply pool empty"))?,
        );

        let mut worker = EventWorker::new(format!("vol-{volume}"), &ctx.queue);
        let poster = worker.poster();
        let completion = Arc::new(VolumeCompletion {
            poster: poster.clone(),
        });
        let conns = ConnectionPool::new(format!("vol-{volume}"), config.transport, completion)
            .with_transport(config.transport, Arc::clone(&ctx.transport));

        let processor = VolumeProcessor::new(
            Arc::clone(&shared),
            poster.clone(),
            Arc::clone(&ctx.meta),
            config.clone(),
            layout,
            conns,
            reply_pool,
        );
        worker.start(processor)?;
        let scanner = TimeoutScanner::start(Arc::clone(&shared), poster.clone(), config)?;

        Ok(Self {
            shared,
            poster,
            worker: Some(worker),
            scanner: Some(scanner),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<&str> {
        self.shared.snapshot.as_deref()
    }

    #[must_use]
    pub fn state(&self) -> VolumeState {
        self.shared.state()
    }

    #[must_use]
    pub fn volume_size(&self) -> u64 {
        self.shared.volume_size()
    }

    #[must_use]
    pub fn stats(&self) -> &VolumeStats {
        &self.shared.stats
    }

    /// Iocbs not currently in use
    #[must_use]
    pub fn free_iocbs(&self) -> usize {
        self.shared.iocbs.remaining()
    }

    /// Metadata generation the worker is currently routing with
    pub fn meta_ver(&self) -> Result<u16> {
        self.poster.sync_invoke(|p: &mut VolumeProcessor| p.meta_ver())
    }

    /// Queue an I/O; `callback` runs exactly once unless this returns an error
    ///
    /// Fails with [`Error::TryAgain`] when all iocbs are in use.
    pub fn submit(
        &self,
        offset: u64,
        op: IoOp<'_>,
        callback: impl FnOnce(Result<Option<Bytes>>) + Send + 'static,
    ) -> Result<()> {
        let state = self.shared.state();
        if state != VolumeState::Opened {
            return Err(Error::VolumeState(state));
        }
        let length = op.len();
        if length > MAX_IO_SIZE {
            return Err(Error::IoTooLarge {
                length,
                max: MAX_IO_SIZE,
            });
        }
        let len64 = length as u64;
        if !is_sector_aligned(offset, len64) {
            return Err(Error::Misaligned {
                offset,
                length: len64,
            });
        }
        let size = self.shared.volume_size();
        if offset.checked_add(len64).is_none_or(|end| end > size) {
            return Err(Error::OutOfRange {
                offset,
                length: len64,
                size,
            });
        }

        let iocb = self.shared.iocbs.alloc().ok_or(Error::TryAgain)?;
        let data = match op {
            IoOp::Write(data) => Some(data),
            IoOp::Read(_) => None,
        };
        let length32 = u32::try_from(length).map_err(|_| Error::IoTooLarge {
            length,
            max: MAX_IO_SIZE,
        })?;
        let callback: IoCallback = Box::new(callback);
        iocb.lock()
            .prepare(op.opcode(), offset, length32, data, callback)?;
        VolumeStats::bump(&self.shared.stats.submitted);

        self.poster.post(ClientEvent::IoRequest(iocb)).map_err(|r| {
            // the iocb recycles with its callback uncalled
            let (err, _event) = r.into_parts();
            warn!("Volume {}: submit refused: {}", self.shared.name, err);
            err
        })
    }

    pub fn submit_write(
        &self,
        offset: u64,
        data: &[u8],
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<()> {
        self.submit(offset, IoOp::Write(data), move |r| callback(r.map(|_| ())))
    }

    pub fn submit_read(
        &self,
        offset: u64,
        length: usize,
        callback: impl FnOnce(Result<Bytes>) + Send + 'static,
    ) -> Result<()> {
        self.submit(offset, IoOp::Read(length), move |r| {
            callback(r.map(Option::unwrap_or_default));
        })
    }

    /// Write and wait; must not be called from a completion callback
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.submit_write(offset, data, move |r| {
            let _ = tx.send(r);
        })?;
        rx.recv()
            .map_err(|_| Error::internal("write callback dropped"))?
    }

    /// Read and wait; must not be called from a completion callback
    pub fn read(&self, offset: u64, length: usize) -> Result<Bytes> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.submit_read(offset, length, move |r| {
            let _ = tx.send(r);
        })?;
        rx.recv()
            .map_err(|_| Error::internal("read callback dropped"))?
    }

    /// Stop accepting I/O and fail whatever is still pending
    pub fn close(&mut self) {
        if self.worker.is_none() && self.scanner.is_none() {
            return;
        }
        info!("Closing volume {}", self.shared.name);
        self.shared.set_state(VolumeState::Closed);
        if let Some(scanner) = self.scanner.take() {
            scanner.stop();
        }
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

impl Drop for ClientVolume {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StoreMode, TestCluster};
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_write_then_read() {
        let cluster = TestCluster::new(&["s1"]);
        let vol = cluster.open("vol", 1 << 30);

        let data = vec![0xab; 4096];
        vol.write(8192, &data).unwrap();
        let read = vol.read(8192, 4096).unwrap();
        assert_eq!(&read[..], &data[..]);
        assert_eq!(vol.stats().completed.load(Ordering::Relaxed), 2);
        assert_eq!(vol.free_iocbs(), cluster.ctx.config.io_depth);
    }

    #[test]
    fn test_submit_validation() {
        let cluster = TestCluster::new(&["s1"]);
        let vol = cluster.open("vol", 1 << 20);

        assert!(matches!(
            vol.submit_write(100, &[0; 512], |_| {}),
            Err(Error::Misaligned { .. })
        ));
        assert!(matches!(
            vol.submit_read(0, MAX_IO_SIZE + 512, |_| {}),
            Err(Error::IoTooLarge { .. })
        ));
        assert!(matches!(
            vol.submit_read(1 << 20, 512, |_| {}),
            Err(Error::OutOfRange { .. })
        ));
        assert_eq!(vol.stats().submitted.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_exhausted_iocbs_try_again() {
        let cluster = TestCluster::with_depth(&["s1"], 2);
        cluster.store("s1").set_mode(StoreMode::Silent);
        let vol = cluster.open("vol", 1 << 20);

        vol.submit_read(0, 512, |_| {}).unwrap();
        vol.submit_read(512, 512, |_| {}).unwrap();
        assert!(matches!(
            vol.submit_read(1024, 512, |_| {}),
            Err(Error::TryAgain)
        ));
    }

    #[test]
    fn test_timeout_resends_and_completes_once() {
        let cluster = TestCluster::new(&["s1"]);
        let store = cluster.store("s1");
        store.set_mode(StoreMode::Silent);
        let vol = cluster.open("vol", 1 << 20);

        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        vol.submit_write(0, &[7; 512], move |r| sink.lock().unwrap().push(r.is_ok()))
            .unwrap();

        assert!(cluster.wait_until(|| vol.stats().resent.load(Ordering::Relaxed) >= 1));
        store.set_mode(StoreMode::Reply);
        store.release_held();

        assert!(cluster.wait_until(|| !results.lock().unwrap().is_empty()));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(*results.lock().unwrap(), vec![true]);
        assert!(vol.stats().timeouts.load(Ordering::Relaxed) >= 1);
        assert_eq!(store.data_at(0, 512), Some(vec![7; 512]));
    }

    #[test]
    fn test_close_fails_pending_io() {
        let cluster = TestCluster::new(&["s1"]);
        cluster.store("s1").set_mode(StoreMode::Silent);
        let mut vol = cluster.open("vol", 1 << 20);

        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..3u64 {
            let tx = tx.clone();
            vol.submit_read(i * 512, 512, move |r| {
                let _ = tx.send(r.map(|_| ()));
            })
            .unwrap();
        }
        vol.close();

        for _ in 0..3 {
            let r = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(matches!(r, Err(Error::VolumeState(VolumeState::Closed))));
        }
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            vol.submit_read(0, 512, |_| {}),
            Err(Error::VolumeState(VolumeState::Closed))
        ));
    }

    #[test]
    fn test_reopen_on_newer_meta_ver() {
        let cluster = TestCluster::new(&["s1"]);
        let vol = cluster.open("vol", 1 << 20);
        assert_eq!(vol.meta_ver().unwrap(), 0);

        cluster.meta.update("vol", |v| v.meta_ver = 3);
        cluster.store("s1").set_meta_ver(3);

        vol.write(0, &[1; 512]).unwrap();
        assert_eq!(vol.meta_ver().unwrap(), 3);
        assert_eq!(vol.state(), VolumeState::Opened);
        assert_eq!(vol.stats().reopens.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unreachable_store_disconnects() {
        let cluster = TestCluster::new(&["s1"]);
        let vol = cluster.open("vol", 1 << 20);
        cluster.net.set_reachable("s1", false);

        let r = vol.read(0, 512);
        assert!(matches!(r, Err(Error::NoConnection { shard: 0 })));
        assert_ne!(vol.state(), VolumeState::Closed);

        cluster.net.set_reachable("s1", true);
        assert!(cluster.wait_until(|| vol.state() == VolumeState::Opened));
        vol.write(0, &[2; 512]).unwrap();
    }
}
