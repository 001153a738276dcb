//! Connection details and the tunnel settings carried inside them.
//!
//! `ConnectionDetails` is a value type: every transformation returns a new map and
//! leaves the original untouched. Secret fields are redacted from `Debug` output.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known detail keys.
pub mod keys {
    pub const HOST: &str = "host";
    pub const PORT: &str = "port";
    pub const USER: &str = "user";
    pub const PASSWORD: &str = "password";
    pub const DBNAME: &str = "dbname";
    pub const SSL: &str = "ssl";
    /// Extra driver options in `key=value&key=value` form.
    pub const ADDITIONAL_OPTIONS: &str = "additional-options";

    pub const TUNNEL_ENABLED: &str = "tunnel-enabled";
    pub const TUNNEL_HOST: &str = "tunnel-host";
    pub const TUNNEL_PORT: &str = "tunnel-port";
    pub const TUNNEL_USER: &str = "tunnel-user";
    pub const TUNNEL_PASS: &str = "tunnel-pass";
    /// Local forwarding port recorded after a tunnel rewrite.
    pub const TUNNEL_LOCAL_PORT: &str = "tunnel-local-port";

    /// Keys whose values never appear in logs or `Debug` output.
    pub const SECRETS: &[&str] = &[PASSWORD, TUNNEL_PASS];

    /// Tunnel keys recognized in configuration URLs.
    pub const TUNNEL_KEYS: &[&str] = &[
        TUNNEL_ENABLED,
        TUNNEL_HOST,
        TUNNEL_PORT,
        TUNNEL_USER,
        TUNNEL_PASS,
    ];
}

/// Named connection fields for one database.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionDetails(Map<String, Value>);

impl ConnectionDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Return a copy with `key` set to `value`.
    pub fn with(&self, key: &str, value: impl Into<Value>) -> Self {
        let mut map = self.0.clone();
        map.insert(key.to_string(), value.into());
        Self(map)
    }

    /// Return a copy without `key`.
    pub fn without(&self, key: &str) -> Self {
        let mut map = self.0.clone();
        map.remove(key);
        Self(map)
    }

    /// Return a copy with `port` filled in when it is absent.
    pub fn with_default_port(&self, port: Option<u16>) -> Self {
        match port {
            Some(port) if !self.contains(keys::PORT) => self.with(keys::PORT, port),
            _ => self.clone(),
        }
    }

    /// A non-empty string field.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// A boolean field, accepting JSON booleans and `"true"`/`"false"` strings.
    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
    }

    /// A port field, accepting JSON numbers and numeric strings.
    ///
    /// Absent or null values are `Ok(None)`; anything else that is not in `1..=65535`
    /// is a configuration error.
    pub fn port_field(&self, key: &str) -> DbResult<Option<u16>> {
        let invalid = || DbError::config(format!("'{}' must be a port number", key));
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|n| u16::try_from(n).ok())
                .filter(|p| *p != 0)
                .map(Some)
                .ok_or_else(invalid),
            Some(Value::String(s)) => s
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .map(Some)
                .ok_or_else(invalid),
            Some(_) => Err(invalid()),
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.str(keys::HOST)
    }

    pub fn port(&self) -> DbResult<Option<u16>> {
        self.port_field(keys::PORT)
    }

    pub fn user(&self) -> Option<&str> {
        self.str(keys::USER)
    }

    pub fn password(&self) -> Option<&str> {
        self.str(keys::PASSWORD)
    }

    pub fn dbname(&self) -> Option<&str> {
        self.str(keys::DBNAME)
    }

    pub fn ssl(&self) -> bool {
        self.bool(keys::SSL).unwrap_or(false)
    }

    pub fn additional_options(&self) -> Option<&str> {
        self.str(keys::ADDITIONAL_OPTIONS)
    }

    pub fn tunnel_enabled(&self) -> bool {
        self.bool(keys::TUNNEL_ENABLED).unwrap_or(false)
    }
}

impl std::fmt::Debug for ConnectionDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.0 {
            if keys::SECRETS.contains(&key.as_str()) {
                map.entry(key, &"****");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

impl FromIterator<(String, Value)> for ConnectionDetails {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// SSH tunnel settings taken from `ConnectionDetails`.
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl TunnelConfig {
    pub const DEFAULT_PORT: u16 = 22;

    /// Extract tunnel settings. `Ok(None)` when `tunnel-enabled` is false or absent.
    pub fn from_details(details: &ConnectionDetails) -> DbResult<Option<Self>> {
        if !details.tunnel_enabled() {
            return Ok(None);
        }

        let required = |key: &str| {
            details.str(key).map(String::from).ok_or_else(|| {
                DbError::config(format!("'{}' is required when tunneling is enabled", key))
            })
        };

        Ok(Some(Self {
            host: required(keys::TUNNEL_HOST)?,
            port: details
                .port_field(keys::TUNNEL_PORT)?
                .unwrap_or(Self::DEFAULT_PORT),
            user: required(keys::TUNNEL_USER)?,
            password: required(keys::TUNNEL_PASS)?,
        }))
    }

    /// Log-safe description of the tunnel endpoint.
    pub fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tunneled() -> ConnectionDetails {
        ConnectionDetails::new()
            .with(keys::HOST, "db.internal")
            .with(keys::PORT, 5432)
            .with(keys::TUNNEL_ENABLED, true)
            .with(keys::TUNNEL_HOST, "bastion.example.com")
            .with(keys::TUNNEL_USER, "deploy")
            .with(keys::TUNNEL_PASS, "hunter2")
    }

    #[test]
    fn test_with_returns_new_map() {
        let original = ConnectionDetails::new().with(keys::HOST, "a");
        let changed = original.with(keys::HOST, "b");
        assert_eq!(original.host(), Some("a"));
        assert_eq!(changed.host(), Some("b"));
    }

    #[test]
    fn test_port_accepts_number_and_string() {
        let details = ConnectionDetails::new().with(keys::PORT, 5432);
        assert_eq!(details.port().unwrap(), Some(5432));

        let details = ConnectionDetails::new().with(keys::PORT, "3306");
        assert_eq!(details.port().unwrap(), Some(3306));

        assert_eq!(ConnectionDetails::new().port().unwrap(), None);
    }

    #[test]
    fn test_port_rejects_out_of_range() {
        let details = ConnectionDetails::new().with(keys::PORT, 70000);
        assert!(matches!(details.port(), Err(DbError::Config { .. })));

        let details = ConnectionDetails::new().with(keys::PORT, "abc");
        assert!(details.port().is_err());

        let details = ConnectionDetails::new().with(keys::PORT, 0);
        assert!(details.port().is_err());
    }

    #[test]
    fn test_with_default_port_keeps_existing() {
        let details = ConnectionDetails::new().with(keys::PORT, 6543);
        let filled = details.with_default_port(Some(5432));
        assert_eq!(filled.port().unwrap(), Some(6543));

        let filled = ConnectionDetails::new().with_default_port(Some(5432));
        assert_eq!(filled.port().unwrap(), Some(5432));
    }

    #[test]
    fn test_bool_accepts_strings() {
        let details = ConnectionDetails::new()
            .with(keys::SSL, "TRUE")
            .with(keys::TUNNEL_ENABLED, "false");
        assert!(details.ssl());
        assert!(!details.tunnel_enabled());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?}", tunneled().with(keys::PASSWORD, "s3cret"));
        assert!(!rendered.contains("s3cret"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("bastion.example.com"));
    }

    #[test]
    fn test_tunnel_config_disabled() {
        let details = ConnectionDetails::new().with(keys::HOST, "db");
        assert!(TunnelConfig::from_details(&details).unwrap().is_none());
    }

    #[test]
    fn test_tunnel_config_defaults_port() {
        let config = TunnelConfig::from_details(&tunneled()).unwrap().unwrap();
        assert_eq!(config.host, "bastion.example.com");
        assert_eq!(config.port, 22);
        assert_eq!(config.user, "deploy");
        assert_eq!(config.describe(), "bastion.example.com:22");
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[test]
    fn test_tunnel_config_requires_fields() {
        let details = tunneled().without(keys::TUNNEL_PASS);
        let err = TunnelConfig::from_details(&details).unwrap_err();
        assert!(err.to_string().contains(keys::TUNNEL_PASS));
    }

    #[test]
    fn test_deserialize_from_json() {
        let details: ConnectionDetails =
            serde_json::from_value(json!({"host": "h", "port": 1, "tunnel-enabled": false}))
                .unwrap();
        assert_eq!(details.host(), Some("h"));
        assert!(!details.tunnel_enabled());
    }
}
