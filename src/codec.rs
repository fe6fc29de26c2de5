//! The UDPGW wire frame: decoding, encoding, and flag semantics.
//!
//! Wire layout (little-endian lengths and IDs, big-endian port):
//!
//! ```text
//! | size   | flags  | conn_id | remote_ip[4 or 16] | remote_port | payload ...
//! | u16 LE | u8     | u16 LE  | raw bytes           | u16 BE      |
//! ```
//!
//! `size` counts every byte that follows it. The address width (4 or 16
//! bytes) is selected by [`Flags::IPV6`]. See `DESIGN.md`'s "Decoder body
//! offset" entry for why the body offsets here differ from the distilled
//! reference implementation's offsets.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, BytesMut};

/// Maximum payload a single frame may carry. Larger datagrams are dropped,
/// never fragmented across frames.
pub const MAX_PAYLOAD_SIZE: usize = 32768;

/// Worst case header size (IPv6 address), including the 2-byte length
/// prefix. `MAX_MESSAGE_SIZE` is built from this so a single buffer can
/// hold any frame this codec will ever produce or accept.
pub const MAX_PREAMBLE_SIZE: usize = 23;

/// Upper bound on total frame size (header + payload).
pub const MAX_MESSAGE_SIZE: usize = MAX_PREAMBLE_SIZE + MAX_PAYLOAD_SIZE;

const IPV4_PREAMBLE_SIZE: usize = 11;
const IPV6_PREAMBLE_SIZE: usize = MAX_PREAMBLE_SIZE;

// header body length (bytes after the 2-byte size field, before payload)
const IPV4_HEADER_LEN: usize = 9; // flags(1) + conn_id(2) + ip(4) + port(2)
const IPV6_HEADER_LEN: usize = 21; // flags(1) + conn_id(2) + ip(16) + port(2)

bitflags::bitflags! {
    /// Per-frame flag byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        /// The frame carries no payload intent and must be discarded by the
        /// decoder without being reported upstream.
        const KEEPALIVE = 0x01;
        /// Discard any existing [`PortForward`](crate::session::PortForward)
        /// for this `conn_id` before acting on this frame.
        const REBIND = 0x02;
        /// Advisory hint that the payload is a DNS message. Informational
        /// only; never changes routing.
        const DNS = 0x04;
        /// The address field is a 16-byte IPv6 address rather than 4-byte IPv4.
        const IPV6 = 0x08;
    }
}

/// A remote endpoint addressed by a frame, either IPv4 or IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl RemoteAddr {
    /// `true` if this address requires the 16-byte (IPv6) wire encoding.
    #[must_use]
    pub const fn is_ipv6(&self) -> bool {
        matches!(self, Self::V6(_))
    }

    /// The preamble size a frame addressed to this endpoint needs.
    #[must_use]
    pub const fn preamble_size(&self) -> usize {
        if self.is_ipv6() {
            IPV6_PREAMBLE_SIZE
        } else {
            IPV4_PREAMBLE_SIZE
        }
    }

    fn write_bytes(&self, buf: &mut [u8]) {
        match self {
            Self::V4(ip) => buf.copy_from_slice(&ip.octets()),
            Self::V6(ip) => buf.copy_from_slice(&ip.octets()),
        }
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(ip) => write!(f, "{ip}"),
            Self::V6(ip) => write!(f, "{ip}"),
        }
    }
}

impl From<RemoteAddr> for std::net::IpAddr {
    fn from(addr: RemoteAddr) -> Self {
        match addr {
            RemoteAddr::V4(ip) => Self::V4(ip),
            RemoteAddr::V6(ip) => Self::V6(ip),
        }
    }
}

/// A decoded, non-keepalive frame from the client.
#[derive(Debug, Clone)]
pub struct Message {
    pub conn_id: u16,
    pub flags: Flags,
    pub remote_ip: RemoteAddr,
    pub remote_port: u16,
    pub payload: BytesMut,
}

impl Message {
    /// `true` if the client asked us to discard any existing `PortForward`
    /// for this `conn_id` before acting on this frame.
    #[must_use]
    pub fn rebind(&self) -> bool {
        self.flags.contains(Flags::REBIND)
    }

    /// The preamble size a downstream response for this `conn_id` needs.
    #[must_use]
    pub fn preamble_size(&self) -> usize {
        self.remote_ip.preamble_size()
    }
}

/// A decode outcome: either a deliverable message, or a keepalive that the
/// caller should silently swallow and keep reading.
pub enum Decoded {
    Message(Message),
    Keepalive,
}

/// The stream ended or the peer sent something we cannot parse. The session
/// treats this as end-of-session; no error frame is ever sent back.
#[derive(Debug)]
pub struct DecodeError(DecodeErrorKind);

#[derive(Debug)]
enum DecodeErrorKind {
    Eof,
    Io(std::io::Error),
    InvalidSize(u16),
    Truncated { size: u16, min: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            DecodeErrorKind::Eof => write!(f, "connection closed"),
            DecodeErrorKind::Io(err) => write!(f, "read error: {err}"),
            DecodeErrorKind::InvalidSize(size) => {
                write!(f, "frame size {size} out of bounds")
            }
            DecodeErrorKind::Truncated { size, min } => {
                write!(f, "frame body of {size} bytes shorter than required {min}")
            }
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.0 {
            DecodeErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self(DecodeErrorKind::Eof)
        } else {
            Self(DecodeErrorKind::Io(err))
        }
    }
}

/// Decode exactly one frame from `reader`.
///
/// Reads the 2-byte length prefix, then the frame body, doing exactly two
/// reads (the length prefix never included in the body). A keepalive frame
/// yields `Decoded::Keepalive` rather than being swallowed here — the
/// caller (the session read loop) iterates, unlike the reference
/// implementation's recursive self-call, so an adversarial peer sending an
/// unbroken stream of keepalives cannot grow the call stack.
pub async fn decode_frame<R>(reader: &mut R) -> Result<Decoded, DecodeError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let size = u16::from_le_bytes(len_buf);

    if (size as usize) < 3 || (size as usize) > MAX_MESSAGE_SIZE - 2 {
        return Err(DecodeError(DecodeErrorKind::InvalidSize(size)));
    }

    let mut body = vec![0u8; size as usize];
    reader.read_exact(&mut body).await?;

    let flags = Flags::from_bits_truncate(body[0]);
    if flags.contains(Flags::KEEPALIVE) {
        return Ok(Decoded::Keepalive);
    }

    let conn_id = u16::from_le_bytes([body[1], body[2]]);

    let (remote_ip, remote_port, payload_start) = if flags.contains(Flags::IPV6) {
        if (size as usize) < IPV6_HEADER_LEN {
            return Err(DecodeError(DecodeErrorKind::Truncated {
                size,
                min: IPV6_HEADER_LEN,
            }));
        }
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&body[3..19]);
        let port = u16::from_be_bytes([body[19], body[20]]);
        (RemoteAddr::V6(Ipv6Addr::from(octets)), port, IPV6_HEADER_LEN)
    } else {
        if (size as usize) < IPV4_HEADER_LEN {
            return Err(DecodeError(DecodeErrorKind::Truncated {
                size,
                min: IPV4_HEADER_LEN,
            }));
        }
        let mut octets = [0u8; 4];
        octets.copy_from_slice(&body[3..7]);
        let port = u16::from_be_bytes([body[7], body[8]]);
        (RemoteAddr::V4(Ipv4Addr::from(octets)), port, IPV4_HEADER_LEN)
    };

    let payload = BytesMut::from(&body[payload_start..]);

    Ok(Decoded::Message(Message {
        conn_id,
        flags,
        remote_ip,
        remote_port,
        payload,
    }))
}

/// Build a downstream frame in-place into `buf`, whose first
/// `remote_ip.preamble_size()` bytes are reserved for the header. `payload`
/// is expected to already sit at that offset. Returns the full frame
/// (header + payload) as a slice into `buf`.
///
/// This mirrors the reference layout exactly: `flags` is always `0` on the
/// wire for responses (the protocol defines no downstream flag semantics).
pub fn encode_response<'a>(
    buf: &'a mut [u8],
    conn_id: u16,
    remote_ip: RemoteAddr,
    remote_port: u16,
    payload_len: usize,
) -> &'a [u8] {
    let preamble_size = remote_ip.preamble_size();
    debug_assert!(buf.len() >= preamble_size + payload_len);

    let size = (preamble_size - 2 + payload_len) as u16;
    let mut header = &mut buf[..preamble_size];
    header.put_u16_le(size);
    header.put_u8(0); // flags
    header.put_u16_le(conn_id);

    let addr_len = if remote_ip.is_ipv6() { 16 } else { 4 };
    remote_ip.write_bytes(&mut buf[5..5 + addr_len]);
    (&mut buf[5 + addr_len..preamble_size]).put_u16(remote_port);

    &buf[..preamble_size + payload_len]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode_upstream_frame(
        flags: Flags,
        conn_id: u16,
        remote_ip: RemoteAddr,
        remote_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let addr_len = if remote_ip.is_ipv6() { 16 } else { 4 };
        let header_len = 1 + 2 + addr_len + 2;
        let size = header_len + payload.len();

        let mut out = Vec::with_capacity(2 + size);
        out.put_u16_le(size as u16);
        out.put_u8(flags.bits());
        out.put_u16_le(conn_id);
        match remote_ip {
            RemoteAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
            RemoteAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
        }
        out.put_u16(remote_port);
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn decodes_ipv4_frame() {
        let wire = encode_upstream_frame(
            Flags::empty(),
            7,
            RemoteAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            53,
            b"ping",
        );
        let mut cursor = Cursor::new(wire);
        let decoded = decode_frame(&mut cursor).await.expect("decode ok");
        let Decoded::Message(msg) = decoded else {
            panic!("expected message, got keepalive")
        };
        assert_eq!(msg.conn_id, 7);
        assert_eq!(msg.remote_ip, RemoteAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(msg.remote_port, 53);
        assert_eq!(&msg.payload[..], b"ping");
        assert!(!msg.rebind());
    }

    #[tokio::test]
    async fn decodes_ipv6_frame_and_preserves_flags() {
        let wire = encode_upstream_frame(
            Flags::IPV6 | Flags::DNS,
            1,
            RemoteAddr::V6(Ipv6Addr::LOCALHOST),
            7,
            b"x",
        );
        let mut cursor = Cursor::new(wire);
        let decoded = decode_frame(&mut cursor).await.expect("decode ok");
        let Decoded::Message(msg) = decoded else {
            panic!("expected message, got keepalive")
        };
        assert_eq!(msg.remote_ip, RemoteAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(msg.preamble_size(), 23);
    }

    #[tokio::test]
    async fn keepalive_frame_then_next_frame_both_decode() {
        let mut wire = Vec::new();
        // keepalive: size=3 (flags + conn_id, no address, no payload)
        wire.put_u16_le(3);
        wire.put_u8(Flags::KEEPALIVE.bits());
        wire.put_u16_le(0);
        wire.extend(encode_upstream_frame(
            Flags::empty(),
            9,
            RemoteAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            80,
            b"y",
        ));

        let mut cursor = Cursor::new(wire);

        let first = decode_frame(&mut cursor).await.expect("decode ok");
        assert!(matches!(first, Decoded::Keepalive));

        let second = decode_frame(&mut cursor).await.expect("decode ok");
        let Decoded::Message(msg) = second else {
            panic!("expected message after keepalive")
        };
        assert_eq!(msg.conn_id, 9);
    }

    #[tokio::test]
    async fn rejects_undersized_ipv4_body() {
        let mut wire = Vec::new();
        wire.put_u16_le(5); // below IPV4_HEADER_LEN (9)
        wire.extend_from_slice(&[0u8; 5]);
        let mut cursor = Cursor::new(wire);
        assert!(decode_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn rejects_oversized_declared_length() {
        let mut wire = Vec::new();
        wire.put_u16_le(u16::MAX);
        let mut cursor = Cursor::new(wire);
        assert!(decode_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn encode_round_trips_ipv4_header() {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let remote = RemoteAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        buf[remote.preamble_size()..remote.preamble_size() + 4].copy_from_slice(b"pong");
        let frame = encode_response(&mut buf, 3, remote, 53, 4);
        assert_eq!(frame.len(), remote.preamble_size() + 4);

        let mut cursor = Cursor::new(frame.to_vec());
        let decoded = decode_frame(&mut cursor).await.expect("decode ok");
        let Decoded::Message(msg) = decoded else {
            panic!("expected message")
        };
        assert_eq!(msg.conn_id, 3);
        assert_eq!(msg.remote_port, 53);
        assert_eq!(&msg.payload[..], b"pong");
    }

    #[test]
    fn preamble_sizes_match_protocol_constants() {
        assert_eq!(
            RemoteAddr::V4(Ipv4Addr::UNSPECIFIED).preamble_size(),
            IPV4_PREAMBLE_SIZE
        );
        assert_eq!(
            RemoteAddr::V6(Ipv6Addr::UNSPECIFIED).preamble_size(),
            IPV6_PREAMBLE_SIZE
        );
        assert_eq!(MAX_MESSAGE_SIZE, MAX_PREAMBLE_SIZE + MAX_PAYLOAD_SIZE);
    }
}
