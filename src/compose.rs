//! Onion composition of middleware.
//!
//! [`Pipeline::run`] walks the stack front to back as each middleware awaits
//! [`Next::run`], and back to front as those awaits return:
//!
//! ```text
//!  request ─▶ mw0 ─▶ mw1 ─▶ mw2 ─▶ (terminal)
//!                                      │
//!  response ◀─ mw0 ◀─ mw1 ◀─ mw2 ◀─────┘
//! ```
//!
//! Every pass keeps one counter, the highest stage entered so far. Entering a
//! stage at or below it means some middleware called `next` twice, and the
//! call fails with [`Error::NextCalledTwice`] instead of running downstream
//! side effects a second time.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::FutureExt as _;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::handler::{BoxFuture, BoxedMiddleware, Middleware};

/// An immutable, ordered middleware list. Cloning is one atomic increment.
#[derive(Clone)]
pub struct Pipeline {
    stack: Arc<[BoxedMiddleware]>,
}

impl Pipeline {
    pub fn new(stack: impl IntoIterator<Item = BoxedMiddleware>) -> Self {
        Self { stack: stack.into_iter().collect() }
    }

    pub fn len(&self) -> usize { self.stack.len() }
    pub fn is_empty(&self) -> bool { self.stack.is_empty() }

    /// Runs one onion pass over `ctx`.
    pub async fn run(&self, ctx: &mut Context) -> Result<()> {
        Chain::new(&self.stack, None).dispatch(0, ctx).await
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").field("len", &self.stack.len()).finish()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(std::iter::empty())
    }
}

impl FromIterator<BoxedMiddleware> for Pipeline {
    fn from_iter<I: IntoIterator<Item = BoxedMiddleware>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// A pipeline nested in another runs its own stack, then continues with the
/// outer `next`.
impl Middleware for Pipeline {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let chain = Chain::new(&self.stack, Some(&next));
            chain.dispatch(0, ctx).await
        })
    }
}

/// State of one pass.
struct Chain<'a> {
    stack: &'a [BoxedMiddleware],
    terminal: Option<&'a Next<'a>>,
    /// One past the highest stage entered.
    entered: AtomicUsize,
}

impl<'a> Chain<'a> {
    fn new(stack: &'a [BoxedMiddleware], terminal: Option<&'a Next<'a>>) -> Self {
        Self { stack, terminal, entered: AtomicUsize::new(0) }
    }

    fn dispatch<'b>(&'b self, index: usize, ctx: &'b mut Context) -> BoxFuture<'b, Result<()>> {
        if self.entered.fetch_max(index + 1, Ordering::SeqCst) > index {
            return Box::pin(std::future::ready(Err(Error::NextCalledTwice)));
        }

        let Some(mw) = self.stack.get(index) else {
            return match self.terminal {
                Some(next) => next.run(ctx),
                None => Box::pin(std::future::ready(Ok(()))),
            };
        };

        let next = Next { chain: self, index: index + 1 };
        match std::panic::catch_unwind(AssertUnwindSafe(move || mw.call(ctx, next))) {
            Ok(fut) => Box::pin(
                AssertUnwindSafe(fut)
                    .catch_unwind()
                    .map(|outcome| outcome.unwrap_or_else(|payload| Err(Error::panicked(payload)))),
            ),
            Err(payload) => Box::pin(std::future::ready(Err(Error::panicked(payload)))),
        }
    }
}

/// Continuation handed to each middleware.
pub struct Next<'a> {
    chain: &'a Chain<'a>,
    index: usize,
}

impl<'a> Next<'a> {
    /// Runs the rest of the pipeline. Valid once; a second call fails with
    /// [`Error::NextCalledTwice`].
    pub fn run<'b>(&'b self, ctx: &'b mut Context) -> BoxFuture<'b, Result<()>> {
        self.chain.dispatch(self.index, ctx)
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").field("index", &self.index).finish()
    }
}
