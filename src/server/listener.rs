//! Accept loop and per-connection serving.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use super::Protocol;
use crate::app::App;
use crate::diagnostics::Verbose;
use crate::error::{Error, Result};

pub(crate) struct ConnOptions {
    pub(crate) protocol: Protocol,
    pub(crate) tls: Option<TlsAcceptor>,
    /// Held for the lifetime of each connection.
    pub(crate) limit: Option<Arc<Semaphore>>,
    pub(crate) keep_alive: Option<Duration>,
    pub(crate) verbose: Verbose,
}

pub(crate) async fn run<F>(listener: TcpListener, app: App, opts: ConnOptions, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let opts = Arc::new(opts);
    let (stop_tx, stop_rx) = watch::channel(());
    let mut tasks = JoinSet::new();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            // Shutdown first so a signal stops accepting even when more
            // connections are queued.
            biased;

            () = &mut signal => {
                info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                break;
            }

            res = accept(&listener, opts.limit.as_ref()) => {
                let (stream, peer, permit) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let app = app.clone();
                let opts = Arc::clone(&opts);
                let stop = stop_rx.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    match connection(stream, peer, app, &opts, stop).await {
                        Ok(()) => {}
                        Err(err) if is_routine(&err) => debug!(%peer, "connection ended: {err}"),
                        Err(err) => {
                            error!(%peer, "connection error: {err}");
                            opts.verbose.emit("server.error", json!({
                                "peer": peer.to_string(),
                                "message": err.to_string(),
                            }));
                        }
                    }
                });
            }

            // Reap finished tasks so the set does not grow without bound.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    drop(listener);
    let _ = stop_tx.send(());
    while tasks.join_next().await.is_some() {}

    info!("wharf stopped");
    Ok(())
}

/// Waits for a connection slot, then for a connection.
async fn accept(
    listener: &TcpListener,
    limit: Option<&Arc<Semaphore>>,
) -> io::Result<(TcpStream, SocketAddr, Option<OwnedSemaphorePermit>)> {
    let permit = match limit {
        Some(limit) => Some(Arc::clone(limit).acquire_owned().await.map_err(io::Error::other)?),
        None => None,
    };
    let (stream, peer) = listener.accept().await?;
    Ok((stream, peer, permit))
}

async fn connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: App,
    opts: &ConnOptions,
    stop: watch::Receiver<()>,
) -> Result<()> {
    match &opts.tls {
        Some(acceptor) => {
            let stream = acceptor.accept(stream).await?;
            serve(TokioIo::new(stream), peer, true, app, opts, stop).await
        }
        None => serve(TokioIo::new(stream), peer, false, app, opts, stop).await,
    }
}

async fn serve<I>(
    io: I,
    peer: SocketAddr,
    tls: bool,
    app: App,
    opts: &ConnOptions,
    mut stop: watch::Receiver<()>,
) -> Result<()>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    // Called once per request on the connection.
    let svc = service_fn(move |req: hyper::Request<Incoming>| {
        let app = app.clone();
        async move { Ok::<_, Infallible>(app.handle(req, Some(peer), tls).await) }
    });

    let builder = builder(opts);
    let conn = builder.serve_connection(io, svc);
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => return res.map_err(Error::Connection),
        _ = stop.changed() => conn.as_mut().graceful_shutdown(),
    }
    conn.await.map_err(Error::Connection)
}

/// Idle keep-alive timeouts and peers hanging up are part of normal traffic.
fn is_routine(err: &Error) -> bool {
    match err {
        Error::Io(e) => is_disconnect(e),
        Error::Connection(e) => match e.downcast_ref::<hyper::Error>() {
            Some(e) => {
                e.is_timeout()
                    || e.is_incomplete_message()
                    || e.is_closed()
                    || e.is_canceled()
                    || std::error::Error::source(e)
                        .and_then(|src| src.downcast_ref::<io::Error>())
                        .is_some_and(is_disconnect)
            }
            None => e.downcast_ref::<io::Error>().is_some_and(is_disconnect),
        },
        _ => false,
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

fn builder(opts: &ConnOptions) -> ConnBuilder<TokioExecutor> {
    let mut builder = ConnBuilder::new(TokioExecutor::new());
    if let Some(timeout) = opts.keep_alive {
        builder.http1().timer(TokioTimer::new()).header_read_timeout(timeout);
    }
    if opts.protocol == Protocol::Http2 {
        builder = builder.http2_only();
    }
    builder
}

/// Resolves on the first SIGTERM or Ctrl-C. A handler that cannot be
/// installed never fires.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::{Config, Pipeline};

    fn options() -> ConnOptions {
        ConnOptions {
            protocol: Protocol::Http,
            tls: None,
            limit: None,
            keep_alive: Some(Duration::from_millis(50)),
            verbose: Verbose::new(),
        }
    }

    #[test]
    fn hangups_are_routine() {
        let reset = Error::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(is_routine(&reset));
        let eof = Error::Connection(Box::new(io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(is_routine(&eof));

        let denied = Error::Io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!is_routine(&denied));
        assert!(!is_routine(&Error::Config("bad".into())));
    }

    #[tokio::test]
    async fn client_leaving_mid_request_is_routine() {
        let (mut client, server) = tokio::io::duplex(1024);
        let app = App::new(Pipeline::default(), &Config::default(), Verbose::new()).unwrap();
        let (_stop_tx, stop) = watch::channel(());
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        client.write_all(b"GET / HTTP/1.1\r\nHost: loc").await.unwrap();
        drop(client);

        let err = serve(TokioIo::new(server), peer, false, app, &options(), stop)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert!(is_routine(&err), "{err}");
    }
}
