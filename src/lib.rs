//! # wharf
//!
//! A small HTTP serving shell. Plugins produce middleware, the middleware is
//! composed into one onion-style pipeline, and the pipeline is served over
//! plain HTTP, HTTPS or HTTP/2.
//!
//! ## The pieces
//!
//! - **Dispatch**: [`Pipeline`] runs middleware front to back and unwinds
//!   back to front. Each middleware decides whether and when to call
//!   [`Next::run`]; calling it twice is an error, not a replay.
//! - **Context**: [`Context`] is the per-request state every middleware
//!   sees: request accessors, response setters, content negotiation, cookies,
//!   redirects and freshness.
//! - **Plugins**: a [`Plugin`] is a middleware factory. A [`Stack`] resolves
//!   plugin specifiers through a [`Registry`], validates them and yields the
//!   pipeline. Loading is all-or-nothing.
//! - **Server**: [`Server::create`] validates the TLS and connection options
//!   and picks the [`Protocol`]; [`Listening::serve`] runs until SIGTERM or
//!   Ctrl-C and drains in-flight connections.
//!
//! Diagnostics from every layer flow through one [`Verbose`] sink, and are
//! mirrored as `tracing` debug events under the `wharf::verbose` target.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use wharf::{from_fn, App, Config, Pipeline, Server, Verbose};
//!
//! #[tokio::main]
//! async fn main() -> wharf::Result<()> {
//!     let config = Config::default();
//!     let verbose = Verbose::new();
//!
//!     let pipeline = Pipeline::new([
//!         from_fn(|ctx, next| Box::pin(async move {
//!             next.run(ctx).await?;
//!             ctx.set_header("x-served-by", "wharf")
//!         })),
//!         from_fn(|ctx, _| Box::pin(async move {
//!             ctx.set_body(format!("hello from {}", ctx.path()));
//!             Ok(())
//!         })),
//!     ]);
//!
//!     let server = Server::create(&config, &verbose)?;
//!     let app = App::new(pipeline, &config, verbose)?;
//!     server.bind().await?.serve(app).await
//! }
//! ```

mod app;
mod body;
mod compose;
mod config;
mod context;
mod cookies;
mod diagnostics;
mod error;
mod fresh;
mod handler;
mod negotiate;
mod plugin;
mod request;
mod response;
mod server;

pub mod mime;
pub mod status;

pub use app::App;
pub use body::{Body, BodyStream, ResponseBody};
pub use compose::{Next, Pipeline};
pub use config::Config;
pub use context::Context;
pub use cookies::{CookieOptions, Cookies, Keygrip};
pub use diagnostics::{Event, Verbose};
pub use error::{BoxError, Error, HttpError, Result};
pub use handler::{BoxFuture, BoxedMiddleware, Middleware, from_fn};
pub use plugin::{OptionDefinition, OptionKind, Plugin, Produced, Registry, Stack, StackEntry};
pub use request::{Request, RequestBody};
pub use response::Response;
pub use server::{Listening, Protocol, Server, ServerHandle};
