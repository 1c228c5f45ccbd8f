//! Configuration surface.
//!
//! Keys are camelCase so a config file reads the same as the command-line
//! flags a front end would map onto it:
//!
//! ```toml
//! port = 8443
//! stack = ["cors", "./local/plugin"]
//! moduleDir = ["plugins", "."]
//! http2 = true
//! keys = ["new-secret", "old-secret"]
//!
//! # anything else is a plugin option
//! corsOrigin = "https://example.com"
//! ```
//!
//! Files are only read from an explicit path; there is no discovery.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Server, stack and plugin configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub port: u16,
    /// Interface to bind; all interfaces when unset.
    pub hostname: Option<String>,
    /// Cap on concurrent connections (HTTP/1.1 and TLS only).
    pub max_connections: Option<usize>,
    /// Keep-alive idle timeout in milliseconds (HTTP/1.1 and TLS only).
    pub keep_alive_timeout: Option<u64>,
    /// Plugin specifiers, in pipeline order.
    pub stack: Vec<String>,
    /// Directories searched first when resolving specifiers.
    pub module_dir: Vec<PathBuf>,
    /// Private key (PEM).
    pub key: Option<PathBuf>,
    /// Certificate chain (PEM).
    pub cert: Option<PathBuf>,
    /// Combined key and certificate bundle (PEM).
    pub pfx: Option<PathBuf>,
    pub https: bool,
    pub http2: bool,
    /// Cookie signing keys, newest first.
    pub keys: Vec<String>,
    /// Trust `X-Forwarded-*` headers.
    pub proxy: bool,
    /// Every other key, for plugins.
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            hostname: None,
            max_connections: None,
            keep_alive_timeout: None,
            stack: Vec::new(),
            module_dir: vec![PathBuf::from(".")],
            key: None,
            cert: None,
            pfx: None,
            https: false,
            http2: false,
            keys: Vec::new(),
            proxy: false,
            options: Map::new(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Reads and parses the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// A plugin option by its camelCase key.
    pub fn option(&self, name: &str) -> Option<&Value> {
        self.options.get(name)
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive_timeout.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.module_dir, [PathBuf::from(".")]);
        assert!(config.stack.is_empty());
        assert!(!config.http2);
    }

    #[test]
    fn camel_case_keys_and_plugin_options() {
        let config = Config::from_toml_str(
            r#"
            port = 9000
            maxConnections = 10
            keepAliveTimeout = 5000
            stack = ["cors", "./local/log"]
            moduleDir = ["plugins"]
            corsOrigin = "*"
            rewrite = ["/a -> /b"]
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_connections, Some(10));
        assert_eq!(config.keep_alive(), Some(Duration::from_secs(5)));
        assert_eq!(config.stack, ["cors", "./local/log"]);
        assert_eq!(config.module_dir, [PathBuf::from("plugins")]);
        assert_eq!(config.option("corsOrigin"), Some(&Value::from("*")));
        assert!(config.option("rewrite").is_some_and(Value::is_array));
        assert!(config.option("port").is_none());
    }

    #[test]
    fn load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wharf.toml");
        std::fs::write(&path, "http2 = true\n").unwrap();
        assert!(Config::load(&path).unwrap().http2);

        let missing = dir.path().join("missing.toml");
        let err = Config::load(&missing).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        assert!(matches!(Config::from_toml_str("port = \"x\""), Err(Error::ConfigParse(_))));
    }
}
