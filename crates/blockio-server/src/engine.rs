//! Storage engines behind one capability interface
//!
//! - [`MemoryEngine`]: sparse in-memory device, completes on the caller
//! - [`FileEngine`]: positional I/O on a backing file, run on a small pool
//!   of engine threads fed through a crossbeam channel
//!
//! Short transfers are reported as [`Error::MediaError`]; the dispatcher
//! never retries them.

use blockio_common::{Error, OpCode, Result, SECTOR_SIZE};
use bytes::{Bytes, BytesMut};
use crossbeam_channel::Sender;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Runs once with the read data (reads) or `None` (writes)
pub type EngineCallback = Box<dyn FnOnce(Result<Option<Bytes>>) + Send>;

/// One device-level I/O
#[derive(Debug, Clone)]
pub struct EngineIo {
    pub opcode: OpCode,
    /// Device offset
    pub offset: u64,
    pub length: usize,
    pub data: Option<Bytes>,
}

pub trait IoEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Addressable bytes
    fn capacity(&self) -> u64;

    /// Start `io`; `done` runs exactly once, on whatever thread finishes it
    fn submit(&self, io: EngineIo, done: EngineCallback);

    /// Read into `buf`, returning the bytes transferred
    fn sync_read(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write `data`, returning the bytes transferred
    fn sync_write(&self, offset: u64, data: &[u8]) -> Result<usize>;

    /// Zeroed buffer of at least `len` bytes, rounded up to whole sectors
    fn aligned_alloc(&self, len: usize) -> BytesMut {
        let sector = SECTOR_SIZE as usize;
        BytesMut::zeroed(len.div_ceil(sector) * sector)
    }
}

/// Execute `io` synchronously through `engine`
pub fn run_io(engine: &dyn IoEngine, io: &EngineIo) -> Result<Option<Bytes>> {
    match io.opcode {
        OpCode::Read => {
            let mut buf = engine.aligned_alloc(io.length);
            let n = engine.sync_read(io.offset, &mut buf[..io.length])?;
            if n != io.length {
                return Err(Error::MediaError(format!(
                    "{}: short read at {}: {} of {} bytes",
                    engine.name(),
                    io.offset,
                    n,
                    io.length
                )));
            }
            buf.truncate(io.length);
            Ok(Some(buf.freeze()))
        }
        OpCode::Write | OpCode::ReplicateWrite => {
            let data = io.data.as_deref().unwrap_or_default();
            if data.len() != io.length {
                return Err(Error::MediaError(format!(
                    "{}: payload of {} bytes for a {} byte write",
                    engine.name(),
                    data.len(),
                    io.length
                )));
            }
            let n = engine.sync_write(io.offset, data)?;
            if n != io.length {
                return Err(Error::MediaError(format!(
                    "{}: short write at {}: {} of {} bytes",
                    engine.name(),
                    io.offset,
                    n,
                    io.length
                )));
            }
            Ok(None)
        }
        OpCode::Heartbeat => Ok(None),
    }
}

fn check_range(name: &str, capacity: u64, offset: u64, length: usize) -> Result<()> {
    let end = offset.checked_add(length as u64);
    if end.is_none_or(|end| end > capacity) {
        return Err(Error::MediaError(format!(
            "{name}: [{offset}, +{length}) beyond device capacity {capacity}"
        )));
    }
    Ok(())
}

const CHUNK_SIZE: u64 = 64 * 1024;

/// Sparse RAM device; unwritten ranges read as zeros
pub struct MemoryEngine {
    name: String,
    capacity: u64,
    chunks: RwLock<HashMap<u64, Box<[u8]>>>,
}

impl MemoryEngine {
    pub fn new(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            chunks: RwLock::new(HashMap::new()),
        }
    }

    /// Split `[offset, offset + len)` into per-chunk pieces
    fn pieces(offset: u64, len: usize) -> impl Iterator<Item = (u64, usize, usize, usize)> {
        let mut pos = offset;
        let end = offset + len as u64;
        std::iter::from_fn(move || {
            if pos >= end {
                return None;
            }
            let chunk = pos / CHUNK_SIZE;
            let within = (pos % CHUNK_SIZE) as usize;
            let take = ((CHUNK_SIZE - pos % CHUNK_SIZE).min(end - pos)) as usize;
            let buf_at = (pos - offset) as usize;
            pos += take as u64;
            Some((chunk, within, buf_at, take))
        })
    }
}

impl IoEngine for MemoryEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn submit(&self, io: EngineIo, done: EngineCallback) {
        done(run_io(self, &io));
    }

    fn sync_read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        check_range(&self.name, self.capacity, offset, buf.len())?;
        let chunks = self.chunks.read();
        for (chunk, within, at, take) in Self::pieces(offset, buf.len()) {
            let dst = &mut buf[at..at + take];
            match chunks.get(&chunk) {
                Some(data) => dst.copy_from_slice(&data[within..within + take]),
                None => dst.fill(0),
            }
        }
        Ok(buf.len())
    }

    fn sync_write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        check_range(&self.name, self.capacity, offset, data.len())?;
        let mut chunks = self.chunks.write();
        for (chunk, within, at, take) in Self::pieces(offset, data.len()) {
            let dst = chunks
                .entry(chunk)
                .or_insert_with(|| vec![0; CHUNK_SIZE as usize].into_boxed_slice());
            dst[within..within + take].copy_from_slice(&data[at..at + take]);
        }
        Ok(data.len())
    }
}

type FileJob = (EngineIo, EngineCallback);

struct FileCore {
    name: String,
    file: File,
    capacity: u64,
}

impl FileCore {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        check_range(&self.name, self.capacity, offset, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(Error::MediaError(format!(
                        "{}: read at {offset} failed: {e}",
                        self.name
                    )));
                }
            }
        }
        Ok(done)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        check_range(&self.name, self.capacity, offset, data.len())?;
        self.file
            .write_all_at(data, offset)
            .map_err(|e| Error::MediaError(format!("{}: write at {offset} failed: {e}", self.name)))?;
        Ok(data.len())
    }
}

impl IoEngine for FileCore {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn submit(&self, io: EngineIo, done: EngineCallback) {
        done(run_io(self, &io));
    }

    fn sync_read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.read_at(offset, buf)
    }

    fn sync_write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.write_at(offset, data)
    }
}

/// Backing-file device with a pool of engine threads
pub struct FileEngine {
    core: Arc<FileCore>,
    jobs: Option<Sender<FileJob>>,
    threads: Vec<JoinHandle<()>>,
}

impl FileEngine {
    /// Open (creating if needed) `path` and size it to `capacity`
    pub fn open(path: &Path, capacity: u64, threads: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < capacity {
            file.set_len(capacity)?;
        }
        let core = Arc::new(FileCore {
            name: path.display().to_string(),
            file,
            capacity,
        });

        let (tx, rx) = crossbeam_channel::unbounded::<FileJob>();
        let mut handles = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            let core = Arc::clone(&core);
            let handle = std::thread::Builder::new()
                .name(format!("file-engine-{i}"))
                .spawn(move || {
                    for (io, done) in &rx {
                        done(run_io(core.as_ref(), &io));
                    }
                    debug!("File engine thread exiting");
                })?;
            handles.push(handle);
        }
        info!(
            "File engine on {} ({} bytes, {} threads)",
            core.name,
            capacity,
            handles.len()
        );
        Ok(Self {
            core,
            jobs: Some(tx),
            threads: handles,
        })
    }
}

impl IoEngine for FileEngine {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn capacity(&self) -> u64 {
        self.core.capacity
    }

    fn submit(&self, io: EngineIo, done: EngineCallback) {
        let Some(jobs) = &self.jobs else {
            done(Err(Error::MediaError(format!("{}: engine stopped", self.core.name))));
            return;
        };
        if let Err(e) = jobs.send((io, done)) {
            let (_, done) = e.into_inner();
            done(Err(Error::MediaError(format!("{}: engine threads gone", self.core.name))));
        }
    }

    fn sync_read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.core.read_at(offset, buf)
    }

    fn sync_write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.core.write_at(offset, data)
    }
}

impl Drop for FileEngine {
    fn drop(&mut self) {
        self.jobs = None;
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("File engine thread of {} panicked", self.core.name);
            }
        }
    }
}
