//! Periodic timeout scanner
//!
//! A plain thread that wakes every `timeout_check_interval`, flags expired
//! send timestamps and posts events for the worker to act on. It never
//! touches an iocb itself.

use crate::event::ClientEvent;
use crate::processor::VolumeProcessor;
use crate::volume::VolumeShared;
use blockio_common::config::ClientConfig;
use blockio_common::{Result, VolumeState};
use blockio_event::EventPoster;
use crossbeam_channel::{RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub(crate) struct TimeoutScanner {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl TimeoutScanner {
    pub fn start(
        shared: Arc<VolumeShared>,
        poster: EventPoster<VolumeProcessor>,
        config: &ClientConfig,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let config = config.clone();
        let handle = std::thread::Builder::new()
            .name(format!("scan-{}", shared.name))
            .spawn(move || {
                let tick = config.timeout_check_interval();
                let mut last_heartbeat = Instant::now();
                let mut last_reconnect = Instant::now();
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    scan_timers(&shared, &poster, config.io_timeout());

                    if last_heartbeat.elapsed() >= config.heartbeat_interval() {
                        last_heartbeat = Instant::now();
                        post(&poster, ClientEvent::SendHeartbeat);
                    }
                    let state = shared.state();
                    if matches!(state, VolumeState::Opened | VolumeState::Closed) {
                        last_reconnect = Instant::now();
                    } else if last_reconnect.elapsed() >= config.reconnect_interval() {
                        last_reconnect = Instant::now();
                        info!("Volume {} is {}, scheduling reconnect", shared.name, state);
                        post(&poster, ClientEvent::Reconnect);
                    }
                }
                debug!("Timeout scanner of {} exiting", shared.name);
            })?;
        Ok(Self { stop_tx, handle })
    }

    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            warn!("Timeout scanner panicked");
        }
    }
}

/// Post one IoTimeout per newly expired timer; returns how many were posted
fn scan_timers(
    shared: &VolumeShared,
    poster: &EventPoster<VolumeProcessor>,
    timeout: Duration,
) -> usize {
    let mut posted = 0;
    for (index, timer) in shared.timers.iter().enumerate() {
        if !timer.try_flag_expired(timeout) {
            continue;
        }
        let Ok(command_id) = u16::try_from(index) else {
            break;
        };
        match poster.post(ClientEvent::IoTimeout { command_id }) {
            Ok(()) => posted += 1,
            Err(r) => {
                // let the next scan try again
                timer.clear_flag();
                error!("IoTimeout cid:{} not queued: {}", command_id, r.reason);
            }
        }
    }
    posted
}

fn post(poster: &EventPoster<VolumeProcessor>, event: ClientEvent) {
    if let Err(r) = poster.post(event) {
        error!("{}: scanner event dropped: {}", poster.name(), r.reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockio_common::config::QueueConfig;
    use blockio_common::time::now_usec;
    use blockio_event::EventWorker;

    #[test]
    fn test_scan_flags_each_expiry_once() {
        let shared = VolumeShared::new("vol", None, 1 << 20, 4).unwrap();
        let worker: EventWorker<VolumeProcessor> = EventWorker::new("scan-test", &QueueConfig::default());
        let poster = worker.poster();
        let timeout = Duration::from_millis(100);

        shared.timers[1].arm(now_usec() - 1_000_000);
        shared.timers[3].arm(now_usec() - 1_000_000);
        shared.timers[2].arm(now_usec());

        assert_eq!(scan_timers(&shared, &poster, timeout), 2);
        assert_eq!(scan_timers(&shared, &poster, timeout), 0);
        assert_eq!(poster.pending(), 2);

        // the worker clears the flag when the request turned out to be fine
        shared.timers[1].clear_flag();
        assert_eq!(scan_timers(&shared, &poster, timeout), 1);
    }

    #[test]
    fn test_stop_joins_promptly() {
        let shared = Arc::new(VolumeShared::new("vol", None, 1 << 20, 2).unwrap());
        let worker: EventWorker<VolumeProcessor> = EventWorker::new("scan-test", &QueueConfig::default());
        let config = ClientConfig {
            timeout_check_interval_ms: 10_000,
            ..ClientConfig::default()
        };
        let scanner = TimeoutScanner::start(shared, worker.poster(), &config).unwrap();
        let started = Instant::now();
        scanner.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_reconnect_posted_only_when_degraded() {
        let shared = Arc::new(VolumeShared::new("vol", None, 1 << 20, 2).unwrap());
        let worker: EventWorker<VolumeProcessor> = EventWorker::new("scan-test", &QueueConfig::default());
        let poster = worker.poster();
        let config = ClientConfig {
            timeout_check_interval_ms: 5,
            reconnect_interval_ms: 10,
            heartbeat_interval_ms: 60_000,
            ..ClientConfig::default()
        };
        let scanner = TimeoutScanner::start(Arc::clone(&shared), poster.clone(), &config).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(poster.pending(), 0);

        shared.set_state(VolumeState::Disconnected);
        let deadline = Instant::now() + Duration::from_secs(5);
        while poster.pending() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        scanner.stop();
        assert!(poster.pending() >= 1);
    }
}
