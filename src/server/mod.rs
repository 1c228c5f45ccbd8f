//! Server factory.
//!
//! [`Server::create`] validates the configuration and picks a protocol
//! before any socket exists; [`Server::bind`] opens the listener;
//! [`Listening::serve`] runs the accept loop until shutdown.
//!
//! ```text
//!   Config ──► Server::create ──► Server ──► bind ──► Listening ──► serve(App)
//!                  │                 │
//!                  └─ fatal errors   └─ handle() ──► plugins
//! ```
//!
//! # Graceful shutdown
//!
//! On SIGTERM or Ctrl-C the listener stops accepting, every open connection
//! is asked to finish its in-flight request and close, and `serve` returns
//! once all of them have.

mod listener;
mod tls;

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;

use crate::app::App;
use crate::config::Config;
use crate::diagnostics::Verbose;
use crate::error::{Error, Result};

use listener::ConnOptions;
use tls::Credentials;

/// Wire protocol a server speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
    /// HTTP/2 over TLS.
    Http2,
}

impl Protocol {
    /// HTTP/2 when requested; HTTPS when any TLS option is present.
    pub fn select(config: &Config) -> Self {
        if config.http2 {
            Self::Http2
        } else if config.key.is_some() || config.cert.is_some() || config.pfx.is_some() || config.https {
            Self::Https
        } else {
            Self::Http
        }
    }

    pub fn scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https | Self::Http2 => "https",
        }
    }

    pub fn is_tls(self) -> bool {
        self != Self::Http
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Http2 => "http2",
        })
    }
}

/// What plugins see of the server they are mounted on.
#[derive(Clone, Debug)]
pub struct ServerHandle {
    protocol: Protocol,
    port: u16,
    hostname: Option<String>,
    verbose: Verbose,
}

impl ServerHandle {
    pub fn protocol(&self) -> Protocol { self.protocol }
    /// The configured port; `0` until bound when the OS picks it.
    pub fn port(&self) -> u16 { self.port }
    pub fn hostname(&self) -> Option<&str> { self.hostname.as_deref() }
    pub fn verbose(&self) -> &Verbose { &self.verbose }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self { protocol: Protocol::Http, port: 0, hostname: None, verbose: Verbose::new() }
    }
}

/// A validated, not yet bound server.
pub struct Server {
    handle: ServerHandle,
    max_connections: Option<usize>,
    keep_alive: Option<Duration>,
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl Server {
    /// Validates `config` and prepares a server for the selected protocol.
    ///
    /// Fails before any socket is opened when the TLS options contradict
    /// each other, when HTTP/2 is combined with options it ignores, or when
    /// credentials cannot be read.
    pub fn create(config: &Config, verbose: &Verbose) -> Result<Self> {
        validate(config)?;
        let protocol = Protocol::select(config);

        let tls = if protocol.is_tls() {
            Some(tls::server_config(&Credentials::from_config(config), protocol)?)
        } else {
            None
        };

        let verbose = verbose.namespaced("server");
        if protocol != Protocol::Http2 {
            verbose.emit("server.config", json!({
                "maxConnections": config.max_connections,
                "keepAliveTimeout": config.keep_alive_timeout,
            }));
        }

        Ok(Self {
            handle: ServerHandle {
                protocol,
                port: config.port,
                hostname: config.hostname.clone(),
                verbose,
            },
            max_connections: config.max_connections,
            keep_alive: config.keep_alive(),
            tls,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.handle.protocol
    }

    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    /// Opens the listening socket.
    pub async fn bind(self) -> Result<Listening> {
        let host = self.handle.hostname.as_deref().unwrap_or("0.0.0.0");
        let listener = TcpListener::bind((host, self.handle.port)).await?;
        let local_addr = listener.local_addr()?;

        let listening = Listening { listener, local_addr, server: self };
        let urls = listening.urls();
        tracing::info!(addr = %local_addr, protocol = %listening.protocol(), "wharf listening");
        listening.server.handle.verbose.emit("server.listening", json!(urls));
        Ok(listening)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("handle", &self.handle)
            .field("max_connections", &self.max_connections)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.key.is_some() != config.cert.is_some() {
        return Err(Error::Config("--key and --cert must be supplied together".into()));
    }
    if config.pfx.is_some() && config.key.is_some() {
        return Err(Error::Config("--pfx cannot be combined with --key and --cert".into()));
    }
    if config.http2 {
        if config.pfx.is_some() {
            return Err(Error::Config("--pfx is not supported with http2, use --key and --cert".into()));
        }
        if config.max_connections.is_some() {
            return Err(Error::Config("--max-connections has no effect with http2".into()));
        }
        if config.keep_alive_timeout.is_some() {
            return Err(Error::Config("--keep-alive-timeout has no effect with http2".into()));
        }
    }
    Ok(())
}

/// A bound server.
pub struct Listening {
    listener: TcpListener,
    local_addr: SocketAddr,
    server: Server,
}

impl Listening {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn protocol(&self) -> Protocol {
        self.server.protocol()
    }

    pub fn handle(&self) -> &ServerHandle {
        &self.server.handle
    }

    /// Addresses clients can reach the server on. An unspecified bind
    /// address is reported as loopback.
    pub fn urls(&self) -> Vec<String> {
        let scheme = self.protocol().scheme();
        let port = self.local_addr.port();
        match (&self.server.handle.hostname, self.local_addr.ip()) {
            (Some(host), _) => vec![format!("{scheme}://{host}:{port}")],
            (None, ip) if ip.is_unspecified() => {
                let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
                vec![format!("{scheme}://{}", SocketAddr::new(loopback, port))]
            }
            (None, ip) => vec![format!("{scheme}://{}", SocketAddr::new(ip, port))],
        }
    }

    /// Serves `app` until SIGTERM or Ctrl-C, then drains.
    pub async fn serve(self, app: App) -> Result<()> {
        self.serve_with_shutdown(app, listener::shutdown_signal()).await
    }

    /// Serves `app` until `signal` resolves, then drains.
    pub async fn serve_with_shutdown<F>(self, app: App, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Listening { listener, server, .. } = self;
        let tls = server.tls.map(tokio_rustls::TlsAcceptor::from);
        let opts = ConnOptions {
            protocol: server.handle.protocol,
            tls,
            limit: server.max_connections.map(|n| Arc::new(tokio::sync::Semaphore::new(n))),
            keep_alive: server.keep_alive,
            verbose: server.handle.verbose,
        };
        listener::run(listener, app, opts, signal).await
    }
}

impl fmt::Debug for Listening {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listening")
            .field("local_addr", &self.local_addr)
            .field("protocol", &self.protocol())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml: &str) -> Config {
        Config::from_toml_str(toml).unwrap()
    }

    #[test]
    fn protocol_selection() {
        assert_eq!(Protocol::select(&config("")), Protocol::Http);
        assert_eq!(Protocol::select(&config("https = true")), Protocol::Https);
        assert_eq!(Protocol::select(&config("pfx = 'x.pem'")), Protocol::Https);
        assert_eq!(Protocol::select(&config("http2 = true\nhttps = true")), Protocol::Http2);
    }

    #[test]
    fn rejects_contradictory_options() {
        let verbose = Verbose::new();
        for toml in [
            "key = 'k.pem'",
            "cert = 'c.pem'",
            "key = 'k.pem'\ncert = 'c.pem'\npfx = 'b.pem'",
            "http2 = true\npfx = 'b.pem'",
        ] {
            let err = Server::create(&config(toml), &verbose).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{toml}: {err}");
        }
    }

    #[test]
    fn http2_rejects_http1_only_options() {
        let verbose = Verbose::new();
        let err = Server::create(&config("http2 = true\nmaxConnections = 5"), &verbose).unwrap_err();
        assert!(err.to_string().contains("--max-connections has no effect with http2"));
        let err = Server::create(&config("http2 = true\nkeepAliveTimeout = 100"), &verbose).unwrap_err();
        assert!(err.to_string().contains("--keep-alive-timeout has no effect with http2"));
    }

    #[test]
    fn config_event_only_for_http1_servers() {
        let verbose = Verbose::new();
        let mut rx = verbose.subscribe();

        let plain = Server::create(&config("maxConnections = 3\nkeepAliveTimeout = 250"), &verbose).unwrap();
        assert_eq!(plain.protocol(), Protocol::Http);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.key, "server.config");
        assert_eq!(event.source.as_deref(), Some("server"));
        assert_eq!(event.value, json!({ "maxConnections": 3, "keepAliveTimeout": 250 }));

        let h2 = Server::create(&config("http2 = true"), &verbose).unwrap();
        assert_eq!(h2.protocol(), Protocol::Http2);
        assert!(rx.try_recv().is_err());
    }
}
