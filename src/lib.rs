//! `udpgw`: a BadVPN/tun2socks-compatible UDP-over-TCP gateway.
//!
//! A single TCP connection from a client multiplexes many logical UDP
//! "connections" (`conn_id`s), each relayed to its own remote endpoint
//! over a dedicated kernel UDP socket. See [`codec`] for the wire frame,
//! [`session`] for per-client state and admission, [`relay`] for the
//! downstream relay task, and [`server`] for the listener and process
//! supervisor.

pub mod codec;
pub mod config;
pub mod error;
mod relay;
pub mod server;
pub mod session;
pub mod trace;
mod udp_socket;
