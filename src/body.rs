//! Response bodies.
//!
//! [`Body`] is what middleware assigns; [`ResponseBody`] is what hyper
//! writes. The conversion happens once, when the response is flushed.
//!
//! `ResponseBody` also owns the *finished* hook: any number of
//! [`Context::on_finished`](crate::Context::on_finished) callbacks queue
//! behind the one hook, which fires exactly once when the body ends, errors,
//! or is dropped because the connection went away.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt, TryStreamExt};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use http_body_util::combinators::UnsyncBoxBody;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::Error;

/// A stream of body chunks.
pub type BodyStream = BoxStream<'static, Result<Bytes, Error>>;

/// Response body as seen by middleware.
///
/// The stream variant sits behind a mutex so that `Body`, and the context
/// holding it, stay `Sync`.
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    Binary(Bytes),
    Stream(Mutex<BodyStream>),
    Json(Value),
}

impl Body {
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, Error>> + Send + 'static,
    {
        Self::Stream(Mutex::new(stream.boxed()))
    }

    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, Error> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Known byte length. `None` for streams; JSON is serialised to measure.
    pub fn len(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Text(s) => Some(s.len() as u64),
            Self::Binary(b) => Some(b.len() as u64),
            Self::Json(v) => serde_json::to_vec(v).ok().map(|v| v.len() as u64),
            Self::Stream(_) => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Self::Binary(b) => f.debug_tuple("Binary").field(b).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
        }
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self { Self::Text(s.to_owned()) }
}

impl From<String> for Body {
    fn from(s: String) -> Self { Self::Text(s) }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self { Self::Binary(b) }
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Self { Self::Binary(b.into()) }
}

impl From<Value> for Body {
    fn from(v: Value) -> Self { Self::Json(v) }
}

impl<T: Into<Body>> From<Option<T>> for Body {
    fn from(v: Option<T>) -> Self { v.map_or(Self::Empty, Into::into) }
}

// ── Finished hook ─────────────────────────────────────────────────────────────

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct FinishState {
    fired: bool,
    queued: Vec<Callback>,
}

/// Shared queue of "response finished" callbacks.
#[derive(Clone, Default)]
pub(crate) struct Finished(Arc<Mutex<FinishState>>);

impl Finished {
    /// Queues `f`, or runs it now if the response already finished.
    pub(crate) fn subscribe(&self, f: Callback) {
        let mut state = self.0.lock();
        if state.fired {
            drop(state);
            f();
        } else {
            state.queued.push(f);
        }
    }

    pub(crate) fn fire(&self) {
        let queued = {
            let mut state = self.0.lock();
            if state.fired {
                return;
            }
            state.fired = true;
            std::mem::take(&mut state.queued)
        };
        for f in queued {
            f();
        }
    }

    #[cfg(test)]
    pub(crate) fn has_fired(&self) -> bool {
        self.0.lock().fired
    }
}

// ── Wire body ─────────────────────────────────────────────────────────────────

/// The body hyper sends. Fires the finished hook on completion or drop.
pub struct ResponseBody {
    inner: UnsyncBoxBody<Bytes, Error>,
    finished: Option<Finished>,
}

impl ResponseBody {
    pub(crate) fn new(inner: UnsyncBoxBody<Bytes, Error>, finished: Finished) -> Self {
        Self { inner, finished: Some(finished) }
    }

    pub fn empty() -> Self {
        Self::detached(Empty::new().map_err(|never| match never {}).boxed_unsync())
    }

    pub fn full(bytes: impl Into<Bytes>) -> Self {
        Self::detached(Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync())
    }

    fn detached(inner: UnsyncBoxBody<Bytes, Error>) -> Self {
        Self { inner, finished: None }
    }

    /// Collects the whole body. Intended for tests and small responses.
    pub async fn collect_bytes(self) -> Result<Bytes, Error> {
        Ok(self.collect().await?.to_bytes())
    }

    fn finish(&mut self) {
        if let Some(finished) = self.finished.take() {
            finished.fire();
        }
    }
}

impl HttpBody for ResponseBody {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if matches!(polled, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            this.finish();
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody").finish_non_exhaustive()
    }
}

/// Converts an assigned body into wire form.
pub(crate) fn into_wire(body: Body) -> UnsyncBoxBody<Bytes, Error> {
    match body {
        Body::Empty => Empty::new().map_err(|never| match never {}).boxed_unsync(),
        Body::Text(s) => full(Bytes::from(s)),
        Body::Binary(b) => full(b),
        Body::Json(v) => full(Bytes::from(serde_json::to_vec(&v).unwrap_or_default())),
        Body::Stream(s) => StreamBody::new(s.into_inner().map_ok(Frame::data)).boxed_unsync(),
    }
}

fn full(bytes: Bytes) -> UnsyncBoxBody<Bytes, Error> {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}
