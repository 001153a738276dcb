//! SSH tunnel sessions backed by libssh2.
//!
//! Provides local port forwarding through a bastion host. The SSH session is shared by a
//! listener thread and one relay thread per accepted connection; the session runs in
//! non-blocking mode so relays never hold libssh2 while waiting on a socket.

use super::{TunnelConnector, TunnelRequest, TunnelSession};
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use ssh2::{Channel, ErrorCode, Session};
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// libssh2's "would block" return code.
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

/// Seconds between keepalive messages on an idle session.
const KEEPALIVE_INTERVAL_SECS: u32 = 30;

/// Sleep between polls right after traffic, and while waiting on libssh2.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Longest sleep between polls of a quiet forwarded connection.
const MAX_IDLE_POLL: Duration = Duration::from_millis(50);

/// Opens [`SshTunnel`]s on the blocking thread pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshTunnelConnector;

#[async_trait]
impl TunnelConnector for SshTunnelConnector {
    async fn connect(&self, request: TunnelRequest) -> DbResult<Box<dyn TunnelSession>> {
        let tunnel = tokio::task::spawn_blocking(move || SshTunnel::open(&request))
            .await
            .map_err(|e| DbError::internal(format!("SSH tunnel task failed: {}", e)))??;
        Ok(Box::new(tunnel))
    }
}

/// An SSH session forwarding a local port to a remote database.
pub struct SshTunnel {
    session: Session,
    local_port: u16,
    remote: String,
    is_running: Arc<AtomicBool>,
    forward_thread: Option<thread::JoinHandle<()>>,
    disconnected: bool,
}

impl std::fmt::Debug for SshTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTunnel")
            .field("local_port", &self.local_port)
            .field("remote", &self.remote)
            .field("is_running", &self.is_running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SshTunnel {
    /// Connect, authenticate with a password and start forwarding.
    ///
    /// Blocks for up to the request's connect timeout per network step.
    pub fn open(request: &TunnelRequest) -> DbResult<Self> {
        let config = &request.config;
        let endpoint = config.describe();
        let timeout = request.connect_timeout;

        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| {
                DbError::connect(
                    format!("Could not resolve SSH host {}: {}", endpoint, e),
                    "Check the tunnel host name",
                )
            })?
            .next()
            .ok_or_else(|| {
                DbError::connect(
                    format!("No addresses found for SSH host {}", endpoint),
                    "Check the tunnel host name",
                )
            })?;

        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            DbError::connect(
                format!("Failed to connect to SSH server {}: {}", endpoint, e),
                "Check that the SSH server is running and the tunnel port is correct",
            )
        })?;

        let mut session = Session::new()
            .map_err(|e| DbError::internal(format!("Failed to create SSH session: {}", e)))?;
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| {
            DbError::connect(
                format!("SSH handshake with {} failed: {}", endpoint, e),
                "Check that the tunnel port belongs to an SSH server",
            )
        })?;

        // The server's host key is accepted without checking known_hosts.
        // TODO: verify against a configured known_hosts file once details can carry one.
        warn!(
            ssh_host = %config.host,
            ssh_port = config.port,
            "SSH host key verification is disabled for this tunnel"
        );

        session
            .userauth_password(&config.user, &config.password)
            .map_err(|e| {
                DbError::auth(format!(
                    "SSH authentication as '{}' on {} failed: {}",
                    config.user, endpoint, e
                ))
            })?;
        if !session.authenticated() {
            return Err(DbError::auth(format!(
                "SSH authentication as '{}' on {} was not confirmed",
                config.user, endpoint
            )));
        }

        session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);
        session.set_timeout(0);

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .and_then(|listener| listener.set_nonblocking(true).map(|()| listener))
            .map_err(|e| {
                DbError::connect(
                    format!("Failed to bind local forwarding port: {}", e),
                    "Check local socket limits",
                )
            })?;
        let local_port = listener
            .local_addr()
            .map_err(|e| DbError::internal(format!("Failed to read forwarding port: {}", e)))?
            .port();

        session.set_blocking(false);

        let is_running = Arc::new(AtomicBool::new(true));
        let forward_thread = start_forwarding_thread(
            listener,
            session.clone(),
            request.remote_host.clone(),
            request.remote_port,
            Arc::clone(&is_running),
        );

        debug!(
            local_port,
            remote = %format!("{}:{}", request.remote_host, request.remote_port),
            "SSH port forward established"
        );

        Ok(Self {
            session,
            local_port,
            remote: format!("{}:{}", request.remote_host, request.remote_port),
            is_running,
            forward_thread: Some(forward_thread),
            disconnected: false,
        })
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }
}

impl TunnelSession for SshTunnel {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn is_open(&self) -> bool {
        !self.disconnected && self.is_running.load(Ordering::SeqCst)
    }

    fn disconnect(&mut self) -> DbResult<()> {
        if self.disconnected {
            return Ok(());
        }
        self.disconnected = true;
        self.is_running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.forward_thread.take() {
            let _ = handle.join();
        }

        self.session.set_blocking(true);
        self.session
            .disconnect(None, "Tunnel closed", None)
            .map_err(|e| {
                DbError::connect(
                    format!("Error disconnecting SSH session: {}", e),
                    "The SSH server may already have closed the session",
                )
            })
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!(local_port = self.local_port, error = %e, "Error closing SSH tunnel");
        }
    }
}

fn is_would_block(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

/// Accept local connections and relay each one over its own SSH channel.
///
/// Also sends keepalives; a failed keepalive marks the tunnel as closed.
fn start_forwarding_thread(
    listener: TcpListener,
    session: Session,
    remote_host: String,
    remote_port: u16,
    is_running: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let keepalive_every = Duration::from_secs(KEEPALIVE_INTERVAL_SECS as u64);
        let mut last_keepalive = Instant::now();

        while is_running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((local_stream, _)) => {
                    let session = session.clone();
                    let remote_host = remote_host.clone();
                    let is_running = Arc::clone(&is_running);

                    thread::spawn(move || {
                        if let Err(e) = relay_connection(
                            local_stream,
                            &session,
                            &remote_host,
                            remote_port,
                            &is_running,
                        ) {
                            debug!(error = %e, "Forwarded connection ended with error");
                        }
                    });
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    if is_running.load(Ordering::SeqCst) {
                        error!(error = %e, "Error accepting forwarded connection");
                    }
                    is_running.store(false, Ordering::SeqCst);
                    break;
                }
            }

            if last_keepalive.elapsed() >= keepalive_every {
                last_keepalive = Instant::now();
                match session.keepalive_send() {
                    Ok(_) => {}
                    Err(ref e) if is_would_block(e) => {}
                    Err(e) => {
                        warn!(error = %e, "SSH keepalive failed, marking tunnel closed");
                        is_running.store(false, Ordering::SeqCst);
                    }
                }
            }
        }

        debug!("Port forwarding thread exiting");
    })
}

/// Open a direct-tcpip channel, retrying while libssh2 reports it would block.
fn open_channel(
    session: &Session,
    remote_host: &str,
    remote_port: u16,
    is_running: &AtomicBool,
) -> std::io::Result<Channel> {
    loop {
        match session.channel_direct_tcpip(remote_host, remote_port, None) {
            Ok(channel) => return Ok(channel),
            Err(ref e) if is_would_block(e) && is_running.load(Ordering::SeqCst) => {
                thread::sleep(IDLE_POLL);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Write all of `buf` to a non-blocking writer.
fn write_fully(
    writer: &mut impl Write,
    mut buf: &[u8],
    is_running: &AtomicBool,
) -> std::io::Result<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                if !is_running.load(Ordering::SeqCst) {
                    return Err(ErrorKind::Interrupted.into());
                }
                thread::sleep(IDLE_POLL);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Double the idle sleep, up to [`MAX_IDLE_POLL`].
fn next_idle_poll(current: Duration) -> Duration {
    (current * 2).min(MAX_IDLE_POLL)
}

/// Relay one accepted connection until either side closes or the tunnel stops.
fn relay_connection(
    mut local_stream: TcpStream,
    session: &Session,
    remote_host: &str,
    remote_port: u16,
    is_running: &AtomicBool,
) -> std::io::Result<()> {
    local_stream.set_nonblocking(true)?;
    let mut channel = open_channel(session, remote_host, remote_port, is_running)?;

    let mut local_buf = [0u8; 8192];
    let mut remote_buf = [0u8; 8192];
    let mut idle_poll = IDLE_POLL;

    while is_running.load(Ordering::SeqCst) {
        let mut activity = false;

        match local_stream.read(&mut local_buf) {
            Ok(0) => break,
            Ok(n) => {
                write_fully(&mut channel, &local_buf[..n], is_running)?;
                activity = true;
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        match channel.read(&mut remote_buf) {
            Ok(0) => {
                if channel.eof() {
                    break;
                }
            }
            Ok(n) => {
                write_fully(&mut local_stream, &remote_buf[..n], is_running)?;
                activity = true;
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        if activity {
            idle_poll = IDLE_POLL;
        } else {
            thread::sleep(idle_poll);
            idle_poll = next_idle_poll(idle_poll);
        }
    }

    let _ = channel.send_eof();
    let _ = channel.close();
    Ok(())
}
