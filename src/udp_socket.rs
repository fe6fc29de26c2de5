//! C2 — one kernel UDP socket per active `conn_id`.

use std::io;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;

use crate::codec::RemoteAddr;

/// An outbound UDP socket bound for the lifetime of one `PortForward`.
///
/// Address family is fixed at construction time, chosen from the first
/// frame's address width for that `conn_id` (IPv4 stays IPv4, IPv6 stays
/// IPv6, for the life of this socket).
pub(crate) struct RemoteSocket {
    inner: UdpSocket,
}

impl RemoteSocket {
    /// Bind a fresh ephemeral-port UDP socket for the given remote address
    /// family, applying best-effort buffer sizing.
    pub(crate) fn bind(remote: RemoteAddr, udp_buffer: usize) -> io::Result<Self> {
        let domain = if remote.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::DGRAM, None)?;
        socket.set_nonblocking(true)?;

        if udp_buffer > 0 {
            // Best effort: a platform that rejects this still gets a
            // working socket, just with OS-default buffer sizes.
            let _ = socket.set_recv_buffer_size(udp_buffer);
            let _ = socket.set_send_buffer_size(udp_buffer);
        }

        let local_addr: SocketAddr = if remote.is_ipv6() {
            SocketAddrV6::new(std::net::Ipv6Addr::UNSPECIFIED, 0, 0, 0).into()
        } else {
            SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        socket.bind(&local_addr.into())?;

        let inner = UdpSocket::from_std(socket.into())?;
        Ok(Self { inner })
    }

    /// Send one datagram to `(remote_ip, remote_port)`. Any error here ends
    /// the owning `PortForward` — the remote is considered dead for this
    /// `conn_id`, and nothing is reported back to the client.
    pub(crate) async fn send_to(
        &self,
        payload: &[u8],
        remote_ip: RemoteAddr,
        remote_port: u16,
    ) -> io::Result<()> {
        let addr = SocketAddr::new(remote_ip.into(), remote_port);
        self.inner.send_to(payload, addr).await.map(|_| ())
    }

    /// Receive one datagram into `buf`, bounded by `timeout` as a liveness
    /// probe only. `Ok(None)` means the timeout elapsed with nothing to
    /// read — callers must *not* treat this as a close, only as a chance
    /// to re-check whether the forward has been closed out from under
    /// them. `Ok(Some(0))` and `Err` both mean the relay task should exit.
    pub(crate) async fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        match tokio::time::timeout(timeout, self.inner.recv(buf)).await {
            Ok(result) => result.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }
}
