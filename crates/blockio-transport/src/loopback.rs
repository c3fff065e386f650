//! In-process transport
//!
//! Each connection pair is two crossbeam channels, one per direction, each
//! drained by its own poller thread that delivers into the receiving
//! connection. Closing either end closes the peer. Addresses can be marked
//! unreachable to simulate failed stores.

use crate::connection::{Acceptor, CompletionHandler, Connection, Link, Transport, WireMessage};
use blockio_common::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

enum Frame {
    Msg(WireMessage),
    Close,
}

struct ChannelLink {
    tx: Sender<Frame>,
    closed: AtomicBool,
}

impl Link for ChannelLink {
    fn send(&self, msg: WireMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed("loopback link closed".into()));
        }
        self.tx
            .send(Frame::Msg(msg))
            .map_err(|_| Error::ConnectionClosed("loopback peer gone".into()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Frame::Close);
        }
    }
}

#[derive(Clone)]
struct Listener {
    acceptor: Arc<dyn Acceptor>,
    handler: Arc<dyn CompletionHandler>,
}

/// Registry of in-process listeners, usable as a [`Transport`]
#[derive(Default)]
pub struct LoopbackNetwork {
    listeners: Mutex<HashMap<String, Listener>>,
    unreachable: Mutex<HashSet<String>>,
    next_id: AtomicU64,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept connections on `addr`
    pub fn listen(
        &self,
        addr: impl Into<String>,
        acceptor: Arc<dyn Acceptor>,
        handler: Arc<dyn CompletionHandler>,
    ) {
        let addr = addr.into();
        info!("Loopback listener registered on {}", addr);
        self.listeners
            .lock()
            .insert(addr, Listener { acceptor, handler });
    }

    pub fn unlisten(&self, addr: &str) {
        self.listeners.lock().remove(addr);
    }

    /// Make new connections to `addr` fail (or succeed again)
    pub fn set_reachable(&self, addr: &str, reachable: bool) {
        let mut down = self.unreachable.lock();
        if reachable {
            down.remove(addr);
        } else {
            down.insert(addr.to_string());
        }
    }

    fn spawn_poller(name: String, rx: Receiver<Frame>, target: Weak<Connection>) -> Result<()> {
        std::thread::Builder::new().name(name).spawn(move || {
            for frame in &rx {
                let Some(conn) = target.upgrade() else { break };
                match frame {
                    Frame::Msg(msg) => conn.deliver(msg),
                    Frame::Close => {
                        conn.close();
                        break;
                    }
                }
            }
            debug!("Loopback poller exiting");
        })?;
        Ok(())
    }
}

impl Transport for LoopbackNetwork {
    fn connect(&self, peer: &str, handler: Arc<dyn CompletionHandler>) -> Result<Arc<Connection>> {
        if self.unreachable.lock().contains(peer) {
            return Err(Error::connection_failed(format!("{peer} unreachable")));
        }
        let listener = self
            .listeners
            .lock()
            .get(peer)
            .cloned()
            .ok_or_else(|| Error::connection_failed(format!("connection refused by {peer}")))?;

        let (to_server, server_rx) = crossbeam_channel::unbounded();
        let (to_client, client_rx) = crossbeam_channel::unbounded();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let client = Arc::new(Connection::new(
            id * 2,
            peer,
            Box::new(ChannelLink {
                tx: to_server,
                closed: AtomicBool::new(false),
            }),
            handler,
        ));
        let server = Arc::new(Connection::new(
            id * 2 + 1,
            format!("client-{id}"),
            Box::new(ChannelLink {
                tx: to_client,
                closed: AtomicBool::new(false),
            }),
            listener.handler,
        ));

        Self::spawn_poller(format!("lo-srv-{id}"), server_rx, Arc::downgrade(&server))?;
        Self::spawn_poller(format!("lo-cli-{id}"), client_rx, Arc::downgrade(&client))?;

        server.mark_ready();
        listener.acceptor.on_accept(&server);
        client.mark_ready();
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BdRef, BufferKind, buffer_pool};
    use crate::connection::{ConnState, WcStatus};
    use blockio_common::{MessageHead, MessageStatus, OpCode};
    use bytes::Bytes;
    use std::time::{Duration, Instant};

    /// Store side: posts receives on accept, echoes each request as a reply
    struct Echo {
        pool: crate::buffer::BufferPool,
        accepted: Mutex<Vec<Arc<Connection>>>,
    }

    impl Acceptor for Echo {
        fn on_accept(&self, conn: &Arc<Connection>) {
            for _ in 0..4 {
                conn.post_recv(self.pool.alloc().unwrap()).unwrap();
            }
            self.accepted.lock().push(Arc::clone(conn));
        }
    }

    impl CompletionHandler for Echo {
        fn on_work_complete(&self, bd: BdRef, status: WcStatus, conn: &Arc<Connection>) {
            if status != WcStatus::Success {
                return;
            }
            let (head, payload) = {
                let b = bd.lock();
                (b.head, Bytes::copy_from_slice(b.payload()))
            };
            let _ = conn.post_send(WireMessage::reply(
                head.reply(MessageStatus::Success, 0),
                Some(payload),
            ));
            let _ = conn.post_recv(bd);
        }
    }

    #[derive(Default)]
    struct Collector {
        got: Mutex<Vec<(u16, Vec<u8>)>>,
        closed: AtomicBool,
    }

    impl CompletionHandler for Collector {
        fn on_work_complete(&self, bd: BdRef, status: WcStatus, _conn: &Arc<Connection>) {
            if status == WcStatus::Success {
                let b = bd.lock();
                self.got.lock().push((b.reply.command_id, b.payload().to_vec()));
            }
        }
        fn on_close(&self, _conn: &Arc<Connection>) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn wait_until(f: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn echo_server(net: &LoopbackNetwork, addr: &str) -> Arc<Echo> {
        let echo = Arc::new(Echo {
            pool: buffer_pool("srv", BufferKind::Command, 16, 4096),
            accepted: Mutex::new(Vec::new()),
        });
        net.listen(addr, Arc::clone(&echo) as Arc<dyn Acceptor>, Arc::clone(&echo) as Arc<dyn CompletionHandler>);
        echo
    }

    #[test]
    fn test_request_reply_round_trip() {
        let net = LoopbackNetwork::new();
        let _echo = echo_server(&net, "store-1");
        let collector = Arc::new(Collector::default());
        let conn = net.connect("store-1", Arc::clone(&collector) as Arc<dyn CompletionHandler>).unwrap();
        assert_eq!(conn.state(), ConnState::Ok);

        let replies = buffer_pool("reply", BufferKind::Reply, 4, 4096);
        conn.post_recv(replies.alloc().unwrap()).unwrap();
        conn.post_send(WireMessage::request(
            MessageHead::new(OpCode::Write, 5),
            Some(Bytes::from_static(b"hello")),
        ))
        .unwrap();

        assert!(wait_until(|| !collector.got.lock().is_empty()));
        assert_eq!(collector.got.lock()[0], (5, b"hello".to_vec()));
        assert!(wait_until(|| replies.remaining() == 4));
    }

    #[test]
    fn test_unreachable_and_refused() {
        let net = LoopbackNetwork::new();
        let _echo = echo_server(&net, "store-1");
        let handler = Arc::new(Collector::default()) as Arc<dyn CompletionHandler>;
        assert!(net.connect("store-2", Arc::clone(&handler)).is_err());
        net.set_reachable("store-1", false);
        assert!(net.connect("store-1", Arc::clone(&handler)).is_err());
        net.set_reachable("store-1", true);
        assert!(net.connect("store-1", handler).is_ok());
    }

    #[test]
    fn test_close_propagates_to_peer() {
        let net = LoopbackNetwork::new();
        let echo = echo_server(&net, "store-1");
        let collector = Arc::new(Collector::default());
        let conn = net.connect("store-1", Arc::clone(&collector) as Arc<dyn CompletionHandler>).unwrap();
        let server_side = Arc::clone(&echo.accepted.lock()[0]);

        server_side.close();
        assert!(wait_until(|| conn.state() == ConnState::Closed));
        assert!(collector.closed.load(Ordering::SeqCst));
        assert!(wait_until(|| echo.pool.remaining() == 16));
    }
}
