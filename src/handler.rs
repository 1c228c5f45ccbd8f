//! Middleware trait and type erasure.
//!
//! # How middleware is stored
//!
//! A pipeline holds middleware of *different* types in one slice. Rust
//! collections can only hold one concrete type, so each middleware sits
//! behind a trait object (`dyn Middleware`) and is shared as an
//! [`Arc`], which the plugin stack and every request task can clone cheaply.
//!
//! The chain from user code to vtable call is:
//!
//! ```text
//! |ctx, next| Box::pin(async move { … })          ← user writes this
//!        ↓ from_fn(closure)
//! Arc::new(closure)                               ← blanket Middleware impl
//!        ↓  stored as BoxedMiddleware = Arc<dyn Middleware>
//! mw.call(ctx, next)  at request time             ← one vtable dispatch
//!        ↓
//! BoxFuture<'a, Result<()>>                       ← borrows ctx and next
//! ```
//!
//! The future borrows the [`Context`] mutably for `'a`, which is what makes
//! the onion work without reference counting: while `next.run(ctx)` is being
//! awaited, the downstream middleware has the context, and when it returns,
//! the borrow ends and this middleware has it back.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::compose::Next;
use crate::context::Context;
use crate::error::Result;

/// A heap-allocated, type-erased future borrowing request state for `'a`.
///
/// `Pin<Box<…>>` because the runtime polls the future in place; `Send` so
/// a request task can move between worker threads.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A unit of request-handling logic.
///
/// Implement this on a struct when the middleware carries state; use
/// [`from_fn`] for closures.
///
/// ```rust
/// use wharf::{from_fn, BoxedMiddleware};
///
/// let powered_by: BoxedMiddleware = from_fn(|ctx, next| Box::pin(async move {
///     next.run(ctx).await?;
///     ctx.set_header("x-powered-by", "wharf")
/// }));
/// ```
pub trait Middleware: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<()>>;
}

/// Shared middleware handle.
pub type BoxedMiddleware = Arc<dyn Middleware>;

impl<F> Middleware for F
where
    F: for<'a> Fn(&'a mut Context, Next<'a>) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<()>> {
        self(ctx, next)
    }
}

/// Boxes a closure as middleware.
///
/// The explicit higher-ranked bound is what lets the compiler infer the
/// closure's signature; passing the closure straight to `Arc::new` does not.
pub fn from_fn<F>(f: F) -> BoxedMiddleware
where
    F: for<'a> Fn(&'a mut Context, Next<'a>) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    Arc::new(f)
}
