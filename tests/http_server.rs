mod common;

use std::time::Duration;

use common::{Reply, TestServer, get, request, send};
use http::StatusCode;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use wharf::{Config, CookieOptions, Pipeline, Verbose, from_fn};

fn hello() -> Pipeline {
    Pipeline::new([
        from_fn(|ctx, next| Box::pin(async move {
            next.run(ctx).await?;
            ctx.set_header("x-served-by", "wharf")
        })),
        from_fn(|ctx, _| Box::pin(async move {
            if ctx.path() == "/hello" {
                ctx.set_body("hello");
            }
            Ok(())
        })),
    ])
}

#[tokio::test]
async fn serves_the_pipeline() {
    let server = TestServer::start(Config::default(), hello()).await;

    let reply = Reply::parse(&get(server.addr, "/hello").await);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("content-length"), Some("5"));
    assert_eq!(reply.header("content-type"), Some("text/plain; charset=utf-8"));
    assert_eq!(reply.header("x-served-by"), Some("wharf"));
    assert_eq!(reply.body, "hello");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn untouched_response_is_404() {
    let server = TestServer::start(Config::default(), hello()).await;

    let reply = Reply::parse(&get(server.addr, "/elsewhere").await);
    assert_eq!(reply.status, 404);
    assert_eq!(reply.body, "Not Found");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn head_keeps_length_drops_body() {
    let server = TestServer::start(Config::default(), hello()).await;

    let raw = request(server.addr, "HEAD", "/hello", &[]).await;
    let reply = Reply::parse(&raw);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("content-length"), Some("5"));
    assert!(reply.body.is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn thrown_errors_are_rendered() {
    let pipeline = Pipeline::new([from_fn(|ctx, _| Box::pin(async move {
        ctx.set_header("x-lost", "yes")?;
        ctx.assert(ctx.get("x-token").is_some(), StatusCode::UNAUTHORIZED, "token required")
    }))]);
    let server = TestServer::start(Config::default(), pipeline).await;

    let reply = Reply::parse(&get(server.addr, "/").await);
    assert_eq!(reply.status, 401);
    assert_eq!(reply.body, "token required");
    assert_eq!(reply.header("x-lost"), None);

    let reply = Reply::parse(&request(server.addr, "GET", "/", &[("x-token", "t")]).await);
    assert_eq!(reply.status, 404);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn internal_errors_hide_details_and_are_reported() {
    let pipeline = Pipeline::new([from_fn(|_, _| Box::pin(async move {
        Err(wharf::Error::Config("database password is hunter2".into()))
    }))]);
    let verbose = Verbose::new();
    let mut events = verbose.subscribe();
    let server = TestServer::start_with(Config::default(), pipeline, verbose).await;

    let reply = Reply::parse(&get(server.addr, "/boom").await);
    assert_eq!(reply.status, 500);
    assert_eq!(reply.body, "Internal Server Error");

    let error = std::iter::from_fn(|| events.try_recv().ok())
        .find(|e| e.key == "ctx.error")
        .expect("ctx.error event");
    assert_eq!(error.value["path"], "/boom");
    assert_eq!(error.value["status"], 500);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn emits_config_then_listening() {
    let verbose = Verbose::new();
    let mut events = verbose.subscribe();
    let config = Config { max_connections: Some(8), ..Config::default() };
    let server = TestServer::start_with(config, hello(), verbose).await;

    let config_event = events.recv().await.unwrap();
    assert_eq!(config_event.key, "server.config");
    assert_eq!(config_event.value["maxConnections"], 8);

    let listening = events.recv().await.unwrap();
    assert_eq!(listening.key, "server.listening");
    assert_eq!(listening.value, json!([format!("http://127.0.0.1:{}", server.addr.port())]));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn signed_cookies_round_trip() {
    let pipeline = Pipeline::new([from_fn(|ctx, _| Box::pin(async move {
        if ctx.path() == "/login" {
            ctx.cookies().set("user", Some("ada"), &CookieOptions::default())?;
            ctx.set_status(204)?;
        } else {
            let user = ctx.cookies().get_signed("user")?;
            ctx.set_body(user.unwrap_or_else(|| "anonymous".into()));
        }
        Ok(())
    }))]);
    let config = Config { keys: vec!["secret".into()], ..Config::default() };
    let server = TestServer::start(config, pipeline).await;

    let login = Reply::parse(&get(server.addr, "/login").await);
    assert_eq!(login.status, 204);
    let cookies: Vec<_> = login
        .all("set-cookie")
        .into_iter()
        .filter_map(|c| c.split(';').next())
        .collect();
    assert_eq!(cookies.len(), 2);
    let jar = cookies.join("; ");

    let me = Reply::parse(&request(server.addr, "GET", "/me", &[("cookie", &jar)]).await);
    assert_eq!(me.body, "ada");

    let forged = Reply::parse(&request(server.addr, "GET", "/me", &[("cookie", "user=eve; user.sig=bad")]).await);
    assert_eq!(forged.body, "anonymous");
    assert!(forged.all("set-cookie").iter().any(|c| c.starts_with("user.sig=;")));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn flushed_headers_stream_the_body() {
    let pipeline = Pipeline::new([from_fn(|ctx, _| Box::pin(async move {
        ctx.set_status(200)?;
        ctx.set_type("text")?;
        ctx.write("tick ").await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.write("tock").await
    }))]);
    let server = TestServer::start(Config::default(), pipeline).await;

    let reply = Reply::parse(&get(server.addr, "/").await);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("transfer-encoding"), Some("chunked"));
    assert!(reply.body.contains("tick "));
    assert!(reply.body.contains("tock"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_drains_in_flight_requests() {
    let pipeline = Pipeline::new([from_fn(|ctx, _| Box::pin(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        ctx.set_body("finished");
        Ok(())
    }))]);
    let server = TestServer::start(Config::default(), pipeline).await;
    let addr = server.addr;

    let in_flight = tokio::spawn(async move { get(addr, "/slow").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.stop().await.unwrap();

    let reply = Reply::parse(&in_flight.await.unwrap());
    assert_eq!(reply.body, "finished");
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn connection_limit_holds_back_extra_clients() {
    let config = Config { max_connections: Some(1), ..Config::default() };
    let server = TestServer::start(config, hello()).await;

    let mut first = TcpStream::connect(server.addr).await.unwrap();
    first.write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
    let mut buf = [0u8; 512];
    let n = first.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));

    // `first` is still open and keeping its slot.
    let addr = server.addr;
    let second = tokio::spawn(async move { get(addr, "/hello").await });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!second.is_finished());

    drop(first);
    let reply = tokio::time::timeout(Duration::from_secs(5), second).await.unwrap().unwrap();
    assert_eq!(Reply::parse(&reply).body, "hello");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn redirect_sets_location_and_note() {
    let pipeline = Pipeline::new([from_fn(|ctx, _| Box::pin(async move {
        ctx.redirect("/new place")
    }))]);
    let server = TestServer::start(Config::default(), pipeline).await;

    let raw = send(
        server.addr,
        "GET /old HTTP/1.1\r\nHost: localhost\r\nAccept: text/html\r\nConnection: close\r\n\r\n",
    )
    .await;
    let reply = Reply::parse(&raw);
    assert_eq!(reply.status, 302);
    assert_eq!(reply.header("location"), Some("/new%20place"));
    assert!(reply.body.contains("<a href=\"/new%20place\">"));

    server.stop().await.unwrap();
}
