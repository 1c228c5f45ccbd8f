//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use wharf::{App, Config, Pipeline, Server, Verbose};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A server on an OS-assigned loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub verbose: Verbose,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<wharf::Result<()>>,
}

impl TestServer {
    pub async fn start(config: Config, pipeline: Pipeline) -> Self {
        Self::start_with(config, pipeline, Verbose::new()).await
    }

    pub async fn start_with(mut config: Config, pipeline: Pipeline, verbose: Verbose) -> Self {
        init_tracing();
        config.port = 0;
        config.hostname.get_or_insert_with(|| "127.0.0.1".into());

        let server = Server::create(&config, &verbose).unwrap();
        let app = App::new(pipeline, &config, verbose.clone()).unwrap();
        let listening = server.bind().await.unwrap();
        let addr = listening.local_addr();

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(listening.serve_with_shutdown(app, async move {
            let _ = stopped.await;
        }));
        Self { addr, verbose, stop: Some(stop), task }
    }

    /// Signals shutdown and waits for the drain to finish.
    pub async fn stop(mut self) -> wharf::Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap()
    }
}

/// Writes `raw` and reads until the server closes.
pub async fn send(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}

pub async fn get(addr: SocketAddr, path: &str) -> String {
    request(addr, "GET", path, &[]).await
}

pub async fn request(addr: SocketAddr, method: &str, path: &str, headers: &[(&str, &str)]) -> String {
    let mut raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    for (name, value) in headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str("\r\n");
    send(addr, &raw).await
}

/// A parsed HTTP/1.1 response.
#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Reply {
    pub fn parse(raw: &str) -> Self {
        let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
        let mut lines = head.split("\r\n");
        let status = lines
            .next()
            .and_then(|line| line.split(' ').nth(1))
            .and_then(|code| code.parse().ok())
            .unwrap_or(0);
        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_owned()))
            .collect();
        Self { status, headers, body: body.to_owned() }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn all(&self, name: &str) -> Vec<&str> {
        self.headers.iter().filter(|(k, _)| k == name).map(|(_, v)| v.as_str()).collect()
    }
}
