//! BlockIO Client - volume submission, timeout and reopen handling
//!
//! A [`ClientVolume`] owns one event worker and one timeout scanner:
//!
//! ```text
//!   submit() ──▶ iocb pool ──▶ IoRequest ──▶ ┌──────────────────┐ ──▶ connection pool ──▶ store
//!                                            │ volume processor │
//!   poller   ──▶ IoComplete ───────────────▶ │  (worker thread) │ ──▶ callback
//!   scanner  ──▶ IoTimeout/Heartbeat/Reconnect└──────────────────┘
//! ```
//!
//! Every iocb mutation happens on the volume's worker thread; the scanner
//! only reads send timestamps and posts events.

mod event;
pub mod iocb;
pub mod meta;
mod processor;
mod scanner;
pub mod volume;

#[cfg(test)]
mod testing;

pub use iocb::{IoCallback, IoTimer};
pub use meta::{ConductorClient, MetadataService, ShardInfo, StaticMetadata, VolumeInfo};
pub use volume::{ClientContext, ClientVolume, IoOp, VolumeStats};
