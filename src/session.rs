//! C3 — per-TCP-client session state and dispatch.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::codec::{self, Decoded, Message, RemoteAddr};
use crate::config::Config;
use crate::relay::{self, RelayTaskArgs};
use crate::udp_socket::RemoteSocket;

/// One logical UDP connection inside a session: a `conn_id` pinned to a
/// remote endpoint, its owned UDP socket, and the relay task reading that
/// socket. Exclusively owned by its `Session`; the relay task only
/// borrows it (via `Arc`s) until closed.
struct PortForward {
    remote_ip: RemoteAddr,
    remote_port: u16,
    socket: Arc<RemoteSocket>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
    relay_handle: tokio::task::JoinHandle<()>,
}

impl PortForward {
    fn remote_ip(&self) -> RemoteAddr {
        self.remote_ip
    }

    fn remote_port(&self) -> u16 {
        self.remote_port
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn socket(&self) -> Arc<RemoteSocket> {
        self.socket.clone()
    }

    /// Mark closed and wake the relay task, without waiting for it to exit.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
    }

    /// Close and wait, bounded to 2 seconds, for the relay task to exit.
    /// After the bound elapses the relay task is abandoned: the OS
    /// reclaims it on process exit, matching the teardown join timeout in
    /// the concurrency model.
    async fn close_and_join(self) {
        self.close();
        let _ = tokio::time::timeout(Duration::from_secs(2), self.relay_handle).await;
    }
}

/// Per TCP peer state: the `conn_id -> PortForward` map, the serialized
/// TCP writer shared with every relay task, and the effective
/// configuration for this session.
pub struct Session<S> {
    config: Arc<Config>,
    peer_addr: SocketAddr,
    writer: Arc<AsyncMutex<WriteHalf<S>>>,
    forwards: AsyncMutex<HashMap<u16, PortForward>>,
    last_activity: StdMutex<Instant>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Run one client session to completion: read frames until the peer
    /// disconnects, the frame stream is malformed, or the idle timeout
    /// elapses, dispatching each frame, then tear down every port forward
    /// before returning.
    pub async fn run(stream: S, peer_addr: SocketAddr, config: Arc<Config>) {
        let (mut reader, writer) = tokio::io::split(stream);

        let session = Self {
            config: config.clone(),
            peer_addr,
            writer: Arc::new(AsyncMutex::new(writer)),
            forwards: AsyncMutex::new(HashMap::new()),
            last_activity: StdMutex::new(Instant::now()),
        };

        let client_timeout = config.client_timeout();

        loop {
            let decoded = match client_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, codec::decode_frame(&mut reader)).await
                {
                    Ok(result) => result,
                    Err(_elapsed) => {
                        tracing::debug!(peer = %peer_addr, "client idle timeout, ending session");
                        break;
                    }
                },
                None => codec::decode_frame(&mut reader).await,
            };

            match decoded {
                Ok(Decoded::Keepalive) => {
                    session.touch();
                }
                Ok(Decoded::Message(msg)) => {
                    session.touch();
                    session.dispatch(msg).await;
                }
                Err(err) => {
                    tracing::debug!(peer = %peer_addr, error = %err, "ending session");
                    break;
                }
            }
        }

        session.teardown().await;
    }

    fn touch(&self) {
        if let Ok(mut last_activity) = self.last_activity.lock() {
            *last_activity = Instant::now();
        }
    }

    async fn dispatch(&self, msg: Message) {
        self.evict_if_stale(&msg).await;
        self.ensure_forward(&msg).await;
        self.send_upstream(&msg).await;
    }

    /// Rebind / mismatch rule: if a forward already exists for this
    /// `conn_id` but the client asked to rebind, pinned to a different
    /// endpoint, or the relay already gave up on it, evict it first.
    async fn evict_if_stale(&self, msg: &Message) {
        let should_evict = {
            let forwards = self.forwards.lock().await;
            forwards.get(&msg.conn_id).is_some_and(|pf| {
                msg.rebind()
                    || pf.is_closed()
                    || pf.remote_ip() != msg.remote_ip
                    || pf.remote_port() != msg.remote_port
            })
        };

        if !should_evict {
            return;
        }

        let removed = {
            let mut forwards = self.forwards.lock().await;
            forwards.remove(&msg.conn_id)
        };

        if let Some(pf) = removed {
            pf.close_and_join().await;
        }
    }

    /// Admission + lazy creation: if no forward exists yet for this
    /// `conn_id`, create one, subject to the per-client connection cap.
    async fn ensure_forward(&self, msg: &Message) {
        let exists = {
            let forwards = self.forwards.lock().await;
            forwards.contains_key(&msg.conn_id)
        };
        if exists {
            return;
        }

        let at_cap = {
            let forwards = self.forwards.lock().await;
            forwards.len() >= self.config.max_connections_for_client
        };
        if at_cap {
            tracing::debug!(
                peer = %self.peer_addr,
                conn_id = msg.conn_id,
                "per-client connection cap reached, dropping frame",
            );
            return;
        }

        let socket = match RemoteSocket::bind(msg.remote_ip, self.config.udp_buffer) {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                tracing::debug!(
                    peer = %self.peer_addr,
                    conn_id = msg.conn_id,
                    error = %err,
                    "failed to create remote udp socket, dropping frame",
                );
                return;
            }
        };

        let pf = self.spawn_port_forward(msg.conn_id, msg.remote_ip, msg.remote_port, socket);

        let mut forwards = self.forwards.lock().await;
        forwards.insert(msg.conn_id, pf);
    }

    fn spawn_port_forward(
        &self,
        conn_id: u16,
        remote_ip: RemoteAddr,
        remote_port: u16,
        socket: Arc<RemoteSocket>,
    ) -> PortForward {
        let closed = Arc::new(AtomicBool::new(false));
        let close_notify = Arc::new(Notify::new());

        let relay_handle = tokio::spawn(relay::run(RelayTaskArgs {
            conn_id,
            remote_ip,
            remote_port,
            socket: socket.clone(),
            closed: closed.clone(),
            close_notify: close_notify.clone(),
            writer: self.writer.clone(),
            udp_timeout: self.config.udp_timeout(),
            peer_addr: self.peer_addr,
        }));

        PortForward {
            remote_ip,
            remote_port,
            socket,
            closed,
            close_notify,
            relay_handle,
        }
    }

    async fn send_upstream(&self, msg: &Message) {
        let socket = {
            let forwards = self.forwards.lock().await;
            forwards.get(&msg.conn_id).map(PortForward::socket)
        };

        let Some(socket) = socket else {
            // admission dropped the frame or socket creation failed above
            return;
        };

        if let Err(err) = socket
            .send_to(&msg.payload, msg.remote_ip, msg.remote_port)
            .await
        {
            tracing::debug!(
                peer = %self.peer_addr,
                conn_id = msg.conn_id,
                error = %err,
                "remote udp send failed, closing forward",
            );
            let removed = {
                let mut forwards = self.forwards.lock().await;
                forwards.remove(&msg.conn_id)
            };
            if let Some(pf) = removed {
                pf.close_and_join().await;
            }
        }
    }

    async fn teardown(self) {
        let forwards = {
            let mut forwards = self.forwards.lock().await;
            std::mem::take(&mut *forwards)
        };
        for (_, pf) in forwards {
            pf.close_and_join().await;
        }
    }
}
