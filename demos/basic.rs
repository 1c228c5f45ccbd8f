//! Minimal wharf example: a two-plugin stack loaded from config.
//!
//! Run with:
//!   RUST_LOG=info,wharf::verbose=debug cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:8000/
//!   curl -i http://localhost:8000/ -H 'accept: application/json'
//!   curl -i http://localhost:8000/visits -c jar -b jar

use std::time::Instant;

use serde_json::json;
use tracing_subscriber::EnvFilter;
use wharf::{App, Config, CookieOptions, Plugin, Produced, Registry, Server, ServerHandle, Stack, Verbose, from_fn};

const CONFIG: &str = r#"
stack = ["timing", "hello"]
keys = ["change-me"]
greeting = "hello from wharf"
"#;

/// Adds an `x-response-time` header.
struct Timing;

impl Plugin for Timing {
    fn name(&self) -> &str { "timing" }

    fn middleware(&self, _: &Config, _: &ServerHandle) -> Produced {
        from_fn(|ctx, next| Box::pin(async move {
            let started = Instant::now();
            next.run(ctx).await?;
            ctx.set_header("x-response-time", &format!("{}ms", started.elapsed().as_millis()))
        }))
        .into()
    }
}

/// Greets in text or JSON, and counts visits in a signed cookie.
struct Hello;

impl Plugin for Hello {
    fn name(&self) -> &str { "hello" }

    fn middleware(&self, config: &Config, _: &ServerHandle) -> Produced {
        let greeting = config
            .option("greeting")
            .and_then(|v| v.as_str())
            .unwrap_or("hello")
            .to_owned();

        from_fn(move |ctx, _| {
            let greeting = greeting.clone();
            Box::pin(async move {
                if ctx.path() == "/visits" {
                    let seen: u64 = ctx.cookies().get_signed("visits")?.and_then(|v| v.parse().ok()).unwrap_or(0);
                    let now = (seen + 1).to_string();
                    ctx.cookies().set("visits", Some(&now), &CookieOptions::default())?;
                    ctx.set_body(format!("visit #{now}"));
                    return Ok(());
                }
                match ctx.accepts(&["text", "json"])? {
                    Some("json") => ctx.set_body(json!({ "greeting": greeting })),
                    _ => ctx.set_body(greeting),
                }
                Ok(())
            })
        })
        .into()
    }
}

#[tokio::main]
async fn main() -> wharf::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_toml_str(CONFIG)?;
    let verbose = Verbose::new();

    let mut registry = Registry::new();
    registry.register("timing", || Timing);
    registry.register("hello", || Hello);

    let stack = Stack::from_config(&config, &registry, &verbose)?;
    let server = Server::create(&config, &verbose)?;
    let pipeline = stack.middleware(&config, server.handle());
    let app = App::new(pipeline, &config, verbose)?;

    let listening = server.bind().await?;
    for url in listening.urls() {
        tracing::info!("serving on {url}");
    }
    listening.serve(app).await
}
