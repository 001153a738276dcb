//! Stub drivers, connection sources and tunnel connectors shared by integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use db_connectivity::config::PoolSettings;
use db_connectivity::db::{ConnectionManager, ConnectionSource, ConnectivityProbe, PoolFactory};
use db_connectivity::driver::{Driver, DriverRegistry, JsonRow, WireSpec, sentinel_row};
use db_connectivity::error::{DbError, DbResult};
use db_connectivity::models::{ConnectionDetails, Database, DatabaseId, DatabaseType, keys};
use db_connectivity::tunnel::{TunnelConnector, TunnelManager, TunnelRequest, TunnelSession};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Local port every stub tunnel reports.
pub const STUB_TUNNEL_PORT: u16 = 54321;

/// Ordered log of lifecycle events across stubs.
#[derive(Debug, Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push(&self, event: &str) {
        self.0.lock().unwrap().push(event.to_string());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == event).count()
    }
}

#[derive(Debug)]
pub struct StubSource {
    events: Events,
    fail_close: bool,
    close_delay: Duration,
}

#[async_trait]
impl ConnectionSource for StubSource {
    async fn check_idle(&self) -> DbResult<()> {
        Ok(())
    }

    async fn close(&self) -> DbResult<()> {
        tokio::time::sleep(self.close_delay).await;
        self.events.push("close");
        if self.fail_close {
            return Err(DbError::internal("close failed"));
        }
        Ok(())
    }

    fn size(&self) -> u32 {
        1
    }
}

#[derive(Debug)]
pub struct StubDriver {
    pub events: Events,
    pub opened: AtomicUsize,
    pub fail_spec: bool,
    pub fail_open: bool,
    pub fail_close: bool,
    pub open_delay: Duration,
    pub close_delay: Duration,
    pub query_delay: Duration,
    pub row: JsonRow,
    pub query_error: Option<String>,
    pub last_query_port: Mutex<Option<u16>>,
}

impl StubDriver {
    pub fn new(events: &Events) -> Self {
        Self {
            events: events.clone(),
            opened: AtomicUsize::new(0),
            fail_spec: false,
            fail_open: false,
            fail_close: false,
            open_delay: Duration::ZERO,
            close_delay: Duration::ZERO,
            query_delay: Duration::ZERO,
            row: sentinel_row(),
            query_error: None,
            last_query_port: Mutex::new(None),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn last_query_port(&self) -> Option<u16> {
        *self.last_query_port.lock().unwrap()
    }
}

#[async_trait]
impl Driver for StubDriver {
    fn kind(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn build_wire_spec(&self, details: &ConnectionDetails) -> DbResult<WireSpec> {
        if self.fail_spec {
            return Err(DbError::config("unsupported option"));
        }
        let host = details
            .host()
            .ok_or_else(|| DbError::config("'host' is required"))?;
        let port = details
            .port()?
            .ok_or_else(|| DbError::config("'port' is required"))?;
        Ok(WireSpec::new(
            DatabaseType::PostgreSQL,
            format!("stub://{}:{}", host, port),
            Some(host.to_string()),
            Some(port),
        ))
    }

    fn humanize_error(&self, raw_message: &str) -> String {
        format!("Stub says: {}", raw_message)
    }

    async fn open_pool(
        &self,
        _spec: &WireSpec,
        _settings: &PoolSettings,
    ) -> DbResult<Arc<dyn ConnectionSource>> {
        self.events.push("open");
        tokio::time::sleep(self.open_delay).await;
        if self.fail_open {
            return Err(DbError::connect("connection refused", "start the server"));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StubSource {
            events: self.events.clone(),
            fail_close: self.fail_close,
            close_delay: self.close_delay,
        }))
    }

    async fn run_trivial_query(&self, spec: &WireSpec) -> DbResult<JsonRow> {
        *self.last_query_port.lock().unwrap() = spec.port();
        tokio::time::sleep(self.query_delay).await;
        match &self.query_error {
            Some(message) => Err(DbError::connect(message.clone(), "")),
            None => Ok(self.row.clone()),
        }
    }
}

#[derive(Debug)]
struct StubSession {
    events: Events,
    disconnects: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
}

impl TunnelSession for StubSession {
    fn local_port(&self) -> u16 {
        STUB_TUNNEL_PORT
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn disconnect(&mut self) -> DbResult<()> {
        self.events.push("tunnel-close");
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct StubConnector {
    events: Events,
    pub fail_auth: bool,
    connects: AtomicUsize,
    disconnects: Arc<AtomicUsize>,
    last_open: Mutex<Option<Arc<AtomicBool>>>,
    last_request: Mutex<Option<TunnelRequest>>,
}

impl StubConnector {
    pub fn new(events: &Events) -> Self {
        Self {
            events: events.clone(),
            fail_auth: false,
            connects: AtomicUsize::new(0),
            disconnects: Arc::new(AtomicUsize::new(0)),
            last_open: Mutex::new(None),
            last_request: Mutex::new(None),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Simulate the most recent session dropping on its own.
    pub fn drop_last_session(&self) {
        if let Some(open) = self.last_open.lock().unwrap().as_ref() {
            open.store(false, Ordering::SeqCst);
        }
    }

    pub fn last_request(&self) -> Option<TunnelRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunnelConnector for StubConnector {
    async fn connect(&self, request: TunnelRequest) -> DbResult<Box<dyn TunnelSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request);
        if self.fail_auth {
            return Err(DbError::auth("SSH authentication failed"));
        }
        self.events.push("tunnel-open");

        let open = Arc::new(AtomicBool::new(true));
        *self.last_open.lock().unwrap() = Some(Arc::clone(&open));
        Ok(Box::new(StubSession {
            events: self.events.clone(),
            disconnects: Arc::clone(&self.disconnects),
            open,
        }))
    }
}

pub fn tunnel_manager(connector: &Arc<StubConnector>) -> TunnelManager {
    TunnelManager::new(connector.clone(), Duration::from_secs(5))
}

pub fn factory(driver: &Arc<StubDriver>, connector: &Arc<StubConnector>) -> PoolFactory {
    let drivers = DriverRegistry::new().with_driver(driver.clone());
    PoolFactory::new(
        Arc::new(drivers),
        Arc::new(tunnel_manager(connector)),
        PoolSettings::default(),
    )
}

pub fn manager(
    driver: &Arc<StubDriver>,
    connector: &Arc<StubConnector>,
    probe_timeout: Duration,
) -> ConnectionManager {
    ConnectionManager::new(
        factory(driver, connector),
        ConnectivityProbe::new(probe_timeout),
    )
}

pub fn plain_details() -> ConnectionDetails {
    ConnectionDetails::new()
        .with(keys::HOST, "db.internal")
        .with(keys::PORT, 5432)
        .with(keys::USER, "analyst")
        .with(keys::PASSWORD, "secret")
        .with(keys::DBNAME, "sales")
}

pub fn tunneled_details(host: &str) -> ConnectionDetails {
    plain_details()
        .with(keys::HOST, host)
        .with(keys::TUNNEL_ENABLED, true)
        .with(keys::TUNNEL_HOST, "bastion.example.com")
        .with(keys::TUNNEL_USER, "deploy")
        .with(keys::TUNNEL_PASS, "hunter2")
}

pub fn database(id: u64, details: ConnectionDetails) -> Database {
    Database::new(DatabaseId::from(id), DatabaseType::PostgreSQL, details)
}

/// Wait until `condition` holds, failing the test after two seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}
