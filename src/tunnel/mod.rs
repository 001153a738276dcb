//! SSH tunnel management.
//!
//! A tunnel is an SSH session with a local port forward to a database host that is not
//! directly reachable. [`TunnelManager`] opens and closes tunnels and rewrites connection
//! details so drivers connect to the local end of the forward instead of the remote host.
//!
//! Tunnels are scoped resources: a [`TunnelHandle`] is owned by exactly one pool or one
//! [`TunnelManager::with_tunnel`] call, and dropping a handle that was never stopped
//! disconnects it.

pub mod ssh;

pub use ssh::{SshTunnel, SshTunnelConnector};

use crate::error::{DbError, DbResult};
use crate::models::{ConnectionDetails, TunnelConfig, keys};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default SSH connect timeout in milliseconds.
pub const DEFAULT_SSH_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Everything needed to open one forward.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub config: TunnelConfig,
    pub remote_host: String,
    pub remote_port: u16,
    pub connect_timeout: Duration,
}

/// A live forwarding session.
pub trait TunnelSession: Send + std::fmt::Debug {
    /// The OS-assigned local port traffic is forwarded from.
    fn local_port(&self) -> u16;

    /// Whether the session is still forwarding.
    fn is_open(&self) -> bool;

    /// Tear the session down. Called at most once per session by [`TunnelHandle`].
    fn disconnect(&mut self) -> DbResult<()>;
}

/// Opens forwarding sessions.
#[async_trait]
pub trait TunnelConnector: Send + Sync + std::fmt::Debug {
    async fn connect(&self, request: TunnelRequest) -> DbResult<Box<dyn TunnelSession>>;
}

/// An open tunnel and the local port it listens on.
#[derive(Debug)]
pub struct TunnelHandle {
    /// `None` once closed.
    session: Option<Box<dyn TunnelSession>>,
    local_port: u16,
    endpoint: String,
}

impl TunnelHandle {
    pub fn new(session: Box<dyn TunnelSession>, endpoint: impl Into<String>) -> Self {
        let local_port = session.local_port();
        Self {
            session: Some(session),
            local_port,
            endpoint: endpoint.into(),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Log-safe `host:port` of the SSH server.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_open(&self) -> bool {
        self.session.as_ref().is_some_and(|session| session.is_open())
    }

    /// Disconnect the session. Only the first call reaches the session.
    pub fn close(&mut self) -> DbResult<()> {
        match self.session.take() {
            Some(mut session) => session.disconnect(),
            None => Ok(()),
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        warn!(
            ssh_endpoint = %self.endpoint,
            local_port = self.local_port,
            "SSH tunnel dropped without being stopped, disconnecting"
        );

        let mut disconnect = move || {
            if let Err(e) = session.disconnect() {
                warn!(error = %e, "Error disconnecting dropped SSH tunnel");
            }
        };
        // Disconnecting blocks; keep it off the async workers when a runtime is around
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(disconnect);
            }
            Err(_) => disconnect(),
        }
    }
}

/// Connection details after an optional tunnel rewrite.
#[derive(Debug)]
pub struct TunneledDetails {
    pub details: ConnectionDetails,
    pub tunnel: Option<TunnelHandle>,
}

impl TunneledDetails {
    pub fn local_port(&self) -> Option<u16> {
        self.tunnel.as_ref().map(TunnelHandle::local_port)
    }
}

/// Split `host` into an optional protocol prefix (such as `https://`) and the bare host.
pub fn split_host_prefix(host: &str) -> (&str, &str) {
    match host.find("://") {
        Some(idx) => host.split_at(idx + 3),
        None => ("", host),
    }
}

/// Opens, closes and scopes SSH tunnels.
#[derive(Debug, Clone)]
pub struct TunnelManager {
    connector: Arc<dyn TunnelConnector>,
    connect_timeout: Duration,
}

impl TunnelManager {
    pub fn new(connector: Arc<dyn TunnelConnector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connect_timeout,
        }
    }

    /// A manager that opens real SSH sessions.
    pub fn ssh(connect_timeout: Duration) -> Self {
        Self::new(Arc::new(SshTunnelConnector), connect_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Open an SSH session and forward an OS-assigned local port to `remote_host:remote_port`.
    pub async fn start_tunnel(
        &self,
        config: &TunnelConfig,
        remote_host: &str,
        remote_port: u16,
    ) -> DbResult<TunnelHandle> {
        info!(
            ssh_host = %config.host,
            ssh_port = config.port,
            remote_host = %remote_host,
            remote_port = remote_port,
            "Opening SSH tunnel"
        );

        let request = TunnelRequest {
            config: config.clone(),
            remote_host: remote_host.to_string(),
            remote_port,
            connect_timeout: self.connect_timeout,
        };

        let session = self.connector.connect(request).await.inspect_err(|e| {
            warn!(ssh_endpoint = %config.describe(), error = %e, "Failed to open SSH tunnel");
        })?;
        let handle = TunnelHandle::new(session, config.describe());

        info!(
            ssh_endpoint = %handle.endpoint(),
            local_port = handle.local_port(),
            "SSH tunnel open"
        );
        Ok(handle)
    }

    /// Disconnect a tunnel. Failures are logged, never returned.
    pub async fn stop_tunnel(&self, handle: TunnelHandle) {
        let endpoint = handle.endpoint().to_string();
        let local_port = handle.local_port();

        // ssh2 disconnects block on the socket
        let result = tokio::task::spawn_blocking(move || {
            let mut handle = handle;
            handle.close()
        })
        .await;

        match result {
            Ok(Ok(())) => info!(ssh_endpoint = %endpoint, local_port, "SSH tunnel closed"),
            Ok(Err(e)) => warn!(
                ssh_endpoint = %endpoint,
                local_port,
                error = %e,
                "Error closing SSH tunnel"
            ),
            Err(e) => warn!(
                ssh_endpoint = %endpoint,
                local_port,
                error = %e,
                "SSH tunnel close task failed"
            ),
        }
    }

    /// Point `details` at the local end of a new tunnel when `tunnel-enabled` is set.
    ///
    /// With tunneling disabled the details come back unchanged and no tunnel is opened.
    /// Otherwise `host` keeps its protocol prefix with the bare host replaced by
    /// `localhost`, and `port` becomes the forwarded local port.
    pub async fn rewrite_details_for_tunnel(
        &self,
        details: &ConnectionDetails,
    ) -> DbResult<TunneledDetails> {
        let Some(config) = TunnelConfig::from_details(details)? else {
            return Ok(TunneledDetails {
                details: details.clone(),
                tunnel: None,
            });
        };

        let host = details
            .host()
            .ok_or_else(|| DbError::config("'host' is required when tunneling is enabled"))?;
        let remote_port = details
            .port()?
            .ok_or_else(|| DbError::config("'port' is required when tunneling is enabled"))?;
        let (prefix, bare_host) = split_host_prefix(host);

        let handle = self.start_tunnel(&config, bare_host, remote_port).await?;
        let local_port = handle.local_port();
        debug!(
            remote_host = %bare_host,
            remote_port,
            local_port,
            "Rewrote connection details for tunnel"
        );

        Ok(TunneledDetails {
            details: details
                .with(keys::HOST, format!("{}localhost", prefix))
                .with(keys::PORT, local_port)
                .with(keys::TUNNEL_LOCAL_PORT, local_port),
            tunnel: Some(handle),
        })
    }

    /// Run `body` with tunnel-rewritten details and stop the tunnel afterwards,
    /// whether `body` succeeded or failed.
    pub async fn with_tunnel<F, Fut, T>(&self, details: &ConnectionDetails, body: F) -> DbResult<T>
    where
        F: FnOnce(ConnectionDetails) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let TunneledDetails { details, tunnel } = self.rewrite_details_for_tunnel(details).await?;
        let result = body(details).await;
        if let Some(handle) = tunnel {
            self.stop_tunnel(handle).await;
        }
        result
    }
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::ssh(Duration::from_millis(DEFAULT_SSH_CONNECT_TIMEOUT_MS))
    }
}
