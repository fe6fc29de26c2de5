//! C4 — one relay task per active `PortForward`, carrying datagrams from
//! the remote UDP socket back to the TCP client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::codec::{self, RemoteAddr, MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE};
use crate::udp_socket::RemoteSocket;

/// Everything a relay task needs; owned by the task for its whole life,
/// built once in `Session::spawn_port_forward`.
pub(crate) struct RelayTaskArgs<S> {
    pub conn_id: u16,
    pub remote_ip: RemoteAddr,
    pub remote_port: u16,
    pub socket: Arc<RemoteSocket>,
    pub closed: Arc<AtomicBool>,
    pub close_notify: Arc<Notify>,
    pub writer: Arc<AsyncMutex<WriteHalf<S>>>,
    pub udp_timeout: Duration,
    pub peer_addr: SocketAddr,
}

/// Receive-encode-write loop for one `PortForward`. Exits when told to
/// close, when the remote socket errors, or when the shared TCP writer
/// fails — the session's read loop discovers a dead relay the next time
/// it touches this `conn_id`, or at teardown.
pub(crate) async fn run<S>(args: RelayTaskArgs<S>)
where
    S: AsyncWrite + Unpin + Send + 'static,
{
    let preamble_size = args.remote_ip.preamble_size();
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

    loop {
        if args.closed.load(Ordering::Acquire) {
            break;
        }

        let recv_result = tokio::select! {
            () = args.close_notify.notified() => break,
            result = args.socket.recv(&mut buf[preamble_size..], args.udp_timeout) => result,
        };

        let size = match recv_result {
            Ok(None) => continue, // liveness timeout, re-check closed and keep waiting
            Ok(Some(0)) => break,
            Ok(Some(size)) if size > MAX_PAYLOAD_SIZE => {
                tracing::trace!(
                    conn_id = args.conn_id,
                    peer = %args.peer_addr,
                    size,
                    "oversize datagram from remote dropped",
                );
                continue;
            }
            Ok(Some(size)) => size,
            Err(err) => {
                tracing::debug!(
                    conn_id = args.conn_id,
                    peer = %args.peer_addr,
                    error = %err,
                    "remote udp receive error, relay exiting",
                );
                break;
            }
        };

        let frame = codec::encode_response(
            &mut buf,
            args.conn_id,
            args.remote_ip,
            args.remote_port,
            size,
        );

        let mut writer = args.writer.lock().await;
        let write_result = writer.write_all(frame).await;
        drop(writer);

        if let Err(err) = write_result {
            tracing::debug!(
                conn_id = args.conn_id,
                peer = %args.peer_addr,
                error = %err,
                "tcp write failed, relay exiting",
            );
            break;
        }
    }

    args.closed.store(true, Ordering::Release);
}
