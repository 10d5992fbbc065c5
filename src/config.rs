use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Client configuration.
///
/// All fields have working defaults except `init_address`, which must name
/// at least one seed endpoint. Options can be built in code or loaded from
/// a TOML file via [`ClientOption::load`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientOption {
    /// Seed endpoints, `host:port`. One entry for standalone deployments,
    /// the sentinel addresses when `sentinel` is set, or any subset of
    /// cluster nodes.
    pub init_address: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Applied with `SETNAME` during the handshake.
    pub client_name: Option<String>,
    /// Logical database selected after the handshake. Not valid for
    /// cluster deployments.
    pub select_db: Option<u32>,
    /// Randomize the seed order so a fleet of clients spreads initial load.
    pub shuffle_init: bool,
    /// Present when the primary is discovered through sentinels.
    pub sentinel: Option<SentinelOption>,
    /// Disable the client-side cache; `do_cache` degrades to `do_cmd`.
    pub disable_cache: bool,
    /// Upper bound on cached entries per connection.
    pub cache_size_each_conn: usize,
    /// Dedicated wires kept per endpoint for blocking/transactional use.
    pub blocking_pool_size: usize,
    pub conn_write_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// log2 of the in-flight ring per wire; submits park when the ring is
    /// full.
    pub ring_scale_each_conn: u8,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    /// Route read-only commands to replicas when the topology knows any.
    pub read_from_replica: bool,
    /// RESP aggregate nesting limit.
    pub max_nesting_depth: usize,
    /// How long submits may park while a sentinel failover is in progress.
    pub failover_timeout_ms: u64,
}

impl Default for ClientOption {
    fn default() -> Self {
        Self {
            init_address: Vec::new(),
            username: None,
            password: None,
            client_name: None,
            select_db: None,
            shuffle_init: false,
            sentinel: None,
            disable_cache: false,
            cache_size_each_conn: 65536,
            blocking_pool_size: 8,
            conn_write_timeout_ms: 5_000,
            connect_timeout_ms: 1_000,
            ring_scale_each_conn: 13,
            read_buffer_size: 512 * 1024,
            write_buffer_size: 512 * 1024,
            read_from_replica: false,
            max_nesting_depth: crate::protocol::DEFAULT_MAX_DEPTH,
            failover_timeout_ms: 10_000,
        }
    }
}

impl ClientOption {
    /// Load options from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| Error::Config(format!("failed to read {}: {err}", path.display())))?;
        let option: ClientOption = toml::from_str(&raw)
            .map_err(|err| Error::Config(format!("failed to parse {}: {err}", path.display())))?;
        option.ensure_valid()?;
        Ok(option)
    }

    pub fn ensure_valid(&self) -> Result<()> {
        if self.init_address.is_empty() {
            return Err(Error::Config("init_address must not be empty".into()));
        }
        for address in &self.init_address {
            if !address.contains(':') {
                return Err(Error::Config(format!(
                    "init_address entry {address:?} is missing a port"
                )));
            }
        }
        if self.ring_scale_each_conn == 0 || self.ring_scale_each_conn > 20 {
            return Err(Error::Config(
                "ring_scale_each_conn must be in 1..=20".into(),
            ));
        }
        if self.blocking_pool_size == 0 {
            return Err(Error::Config("blocking_pool_size must be at least 1".into()));
        }
        if let Some(sentinel) = &self.sentinel {
            if sentinel.master_set.trim().is_empty() {
                return Err(Error::Config("sentinel.master_set must not be empty".into()));
            }
            if self.select_db.is_some() {
                return Err(Error::Config(
                    "select_db cannot be combined with sentinel discovery".into(),
                ));
            }
        }
        Ok(())
    }

    /// In-flight entries per wire.
    pub fn ring_size(&self) -> usize {
        1usize << self.ring_scale_each_conn
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    /// Zero disables the write deadline.
    pub fn write_timeout(&self) -> Option<Duration> {
        if self.conn_write_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.conn_write_timeout_ms))
        }
    }

    pub fn failover_timeout(&self) -> Duration {
        Duration::from_millis(self.failover_timeout_ms.max(1))
    }

    /// Credentials for the `HELLO` handshake. A bare password authenticates
    /// as the `default` user.
    pub fn hello_credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            (None, Some(pass)) => Some(("default".into(), pass.clone())),
            _ => None,
        }
    }
}

/// Sentinel-backed primary discovery settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SentinelOption {
    /// The monitored master set name, as known by the sentinels.
    pub master_set: String,
    /// Credentials for the sentinels themselves; the primary uses the
    /// top-level credentials.
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SentinelOption {
    pub fn hello_credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            (None, Some(pass)) => Some(("default".into(), pass.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ClientOption;

    #[test]
    fn defaults_are_valid_once_addressed() {
        let mut option = ClientOption::default();
        assert!(option.ensure_valid().is_err());
        option.init_address = vec!["127.0.0.1:6379".into()];
        option.ensure_valid().unwrap();
        assert_eq!(option.ring_size(), 8192);
    }

    #[test]
    fn parses_from_toml() {
        let option: ClientOption = toml::from_str(
            r#"
            init_address = ["10.0.0.1:6379", "10.0.0.2:6379"]
            shuffle_init = true
            cache_size_each_conn = 1024

            [sentinel]
            master_set = "mymaster"
            password = "hunter2"
            "#,
        )
        .unwrap();
        option.ensure_valid().unwrap();
        assert!(option.shuffle_init);
        assert_eq!(option.cache_size_each_conn, 1024);
        let sentinel = option.sentinel.unwrap();
        assert_eq!(sentinel.master_set, "mymaster");
        assert_eq!(
            sentinel.hello_credentials(),
            Some(("default".into(), "hunter2".into()))
        );
    }

    #[test]
    fn bare_password_authenticates_default_user() {
        let option = ClientOption {
            init_address: vec!["127.0.0.1:6379".into()],
            password: Some("secret".into()),
            ..ClientOption::default()
        };
        assert_eq!(
            option.hello_credentials(),
            Some(("default".into(), "secret".into()))
        );
    }

    #[test]
    fn rejects_select_db_with_sentinel() {
        let option = ClientOption {
            init_address: vec!["127.0.0.1:26379".into()],
            select_db: Some(2),
            sentinel: Some(super::SentinelOption {
                master_set: "mymaster".into(),
                ..Default::default()
            }),
            ..ClientOption::default()
        };
        assert!(option.ensure_valid().is_err());
    }
}
