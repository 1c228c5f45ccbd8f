//! Per-request context.
//!
//! A [`Context`] wraps one [`Request`] and one [`Response`] and adds the
//! derived, lazily computed views middleware reaches for: negotiated types,
//! the cookie jar, freshness. It is created by the app for each request,
//! handed down the pipeline by `&mut`, and turned into an HTTP response once
//! the pipeline settles.
//!
//! Most request and response accessors are re-exported here so middleware
//! rarely needs [`request`](Context::request) or
//! [`response_mut`](Context::response_mut) directly.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use http::header::{self, HeaderName};
use http::{Extensions, Method, StatusCode, Uri, Version};
use http_body_util::combinators::UnsyncBoxBody;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::body::{self, Body, Finished, ResponseBody};
use crate::cookies::{Cookies, Keygrip};
use crate::diagnostics::Verbose;
use crate::error::{BoxError, Error, HttpError, Result};
use crate::negotiate::{self, Accept};
use crate::request::Request;
use crate::response::Response;
use crate::{fresh, status};

const STREAM_BUFFER: usize = 16;

/// Application-wide state every context shares.
#[derive(Debug, Default)]
pub(crate) struct Env {
    pub(crate) verbose: Verbose,
    pub(crate) keys: Option<Arc<Keygrip>>,
    pub(crate) proxy: bool,
}

pub(crate) type HeadSender = oneshot::Sender<http::Response<ResponseBody>>;

/// State for one request/response exchange.
pub struct Context {
    request: Request,
    response: Response,
    env: Arc<Env>,
    state: Extensions,
    cookies: Option<Cookies>,
    accept: OnceLock<Accept>,
    finished: Finished,
    head_tx: Option<HeadSender>,
    stream_tx: Option<mpsc::Sender<Result<Bytes>>>,
}

impl Context {
    /// A context detached from any connection: no peer, no TLS, a private
    /// diagnostic sink. Useful for driving a [`Pipeline`](crate::Pipeline)
    /// directly.
    pub fn new<B>(req: http::Request<B>) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self {
            request: Request::new(req),
            response: Response::default(),
            env: Arc::default(),
            state: Extensions::new(),
            cookies: None,
            accept: OnceLock::new(),
            finished: Finished::default(),
            head_tx: None,
            stream_tx: None,
        }
    }

    pub(crate) fn attach(&mut self, env: Arc<Env>, peer: Option<SocketAddr>, tls: bool, head_tx: HeadSender) {
        self.request.connect(peer, tls, env.proxy);
        self.env = env;
        self.head_tx = Some(head_tx);
    }

    #[cfg(test)]
    pub(crate) fn mock() -> Self {
        Self::new(http::Request::new(http_body_util::Empty::<Bytes>::new()))
    }

    pub fn request(&self) -> &Request { &self.request }
    pub fn request_mut(&mut self) -> &mut Request { &mut self.request }
    pub fn response(&self) -> &Response { &self.response }
    pub fn response_mut(&mut self) -> &mut Response { &mut self.response }

    /// Typed per-request state shared between middleware.
    pub fn state(&self) -> &Extensions { &self.state }
    pub fn state_mut(&mut self) -> &mut Extensions { &mut self.state }

    /// The app's diagnostic sink.
    pub fn verbose(&self) -> &Verbose { &self.env.verbose }

    // ── Request delegates ────────────────────────────────────────────────────

    pub fn method(&self) -> &Method { self.request.method() }
    pub fn uri(&self) -> &Uri { self.request.uri() }
    pub fn version(&self) -> Version { self.request.version() }
    pub fn path(&self) -> &str { self.request.path() }
    pub fn querystring(&self) -> &str { self.request.querystring() }
    pub fn query(&self) -> &[(String, String)] { self.request.query() }
    pub fn host(&self) -> Option<&str> { self.request.host() }
    pub fn hostname(&self) -> Option<&str> { self.request.hostname() }
    pub fn protocol(&self) -> &str { self.request.protocol() }
    pub fn secure(&self) -> bool { self.request.secure() }
    pub fn ip(&self) -> Option<IpAddr> { self.request.ip() }
    pub fn ips(&self) -> Vec<IpAddr> { self.request.ips() }

    /// Request header value.
    pub fn get(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.request.header(name)
    }

    pub fn request_content_type(&self) -> Option<&str> { self.request.content_type() }
    pub fn request_length(&self) -> Option<u64> { self.request.content_length() }

    /// The request body, collected on first call.
    pub async fn body_bytes(&mut self) -> Result<Bytes> {
        self.request.body_bytes().await
    }

    /// See [`Request::is`].
    pub fn is(&self, types: &[&str]) -> Result<Option<String>> {
        self.request.is(types)
    }

    // ── Response delegates ───────────────────────────────────────────────────

    pub fn status(&self) -> StatusCode { self.response.status() }
    pub fn set_status(&mut self, code: u16) -> Result<()> { self.response.set_status(code) }
    pub fn message(&self) -> &'static str { self.response.message() }
    pub fn body(&self) -> &Body { self.response.body() }
    pub fn set_body(&mut self, body: impl Into<Body>) { self.response.set_body(body) }
    pub fn length(&self) -> Option<u64> { self.response.length() }
    pub fn set_length(&mut self, len: u64) { self.response.set_length(len) }
    pub fn set_type(&mut self, ty: &str) -> Result<()> { self.response.set_type(ty) }
    pub fn vary(&mut self, field: &str) -> Result<()> { self.response.vary(field) }
    pub fn set_etag(&mut self, etag: &str) -> Result<()> { self.response.set_etag(etag) }
    pub fn headers_sent(&self) -> bool { self.response.headers_sent() }

    pub fn set_last_modified(&mut self, at: SystemTime) -> Result<()> {
        self.response.set_last_modified(at)
    }

    pub fn attachment(&mut self, filename: Option<&str>) -> Result<()> {
        self.response.attachment(filename)
    }

    pub fn set_header<K>(&mut self, name: K, value: &str) -> Result<()>
    where
        K: TryInto<HeaderName>,
        K::Error: fmt::Display,
    {
        self.response.set_header(name, value)
    }

    pub fn append_header<K>(&mut self, name: K, value: &str) -> Result<()>
    where
        K: TryInto<HeaderName>,
        K::Error: fmt::Display,
    {
        self.response.append_header(name, value)
    }

    pub fn remove_header(&mut self, name: impl header::AsHeaderName) {
        self.response.remove_header(name)
    }

    // ── Negotiation ──────────────────────────────────────────────────────────

    fn accept(&self) -> &Accept {
        self.accept.get_or_init(|| Accept::parse(self.request.header(header::ACCEPT)))
    }

    /// Best of `types` for the request's `Accept` header.
    pub fn accepts<'t>(&self, types: &[&'t str]) -> Result<Option<&'t str>> {
        self.accept().negotiate(types)
    }

    /// Media ranges the client accepts, most preferred first.
    pub fn accepted_types(&self) -> Vec<String> {
        self.accept().preferred()
    }

    pub fn accepts_encodings<'t>(&self, encodings: &[&'t str]) -> Option<&'t str> {
        negotiate::encodings(self.get(header::ACCEPT_ENCODING), encodings)
    }

    pub fn accepts_charsets<'t>(&self, charsets: &[&'t str]) -> Option<&'t str> {
        negotiate::charsets(self.get(header::ACCEPT_CHARSET), charsets)
    }

    pub fn accepts_languages<'t>(&self, languages: &[&'t str]) -> Option<&'t str> {
        negotiate::languages(self.get(header::ACCEPT_LANGUAGE), languages)
    }

    /// Languages the client lists, most preferred first. `["*"]` without an
    /// `Accept-Language` header.
    pub fn accepted_languages(&self) -> Vec<String> {
        negotiate::preferred_values(self.get(header::ACCEPT_LANGUAGE), "*")
    }

    pub fn accepted_charsets(&self) -> Vec<String> {
        negotiate::preferred_values(self.get(header::ACCEPT_CHARSET), "*")
    }

    /// Whether the client's cached copy is still good. Only GET and HEAD
    /// requests answered with 2xx or 304 can be fresh.
    pub fn fresh(&self) -> bool {
        let method = self.method();
        if method != Method::GET && method != Method::HEAD {
            return false;
        }
        let code = self.status().as_u16();
        if !((200..300).contains(&code) || code == 304) {
            return false;
        }
        fresh::is_fresh(self.request.headers(), self.response.headers())
    }

    pub fn stale(&self) -> bool {
        !self.fresh()
    }

    // ── Cookies ──────────────────────────────────────────────────────────────

    /// The cookie jar, parsed from the request on first use.
    pub fn cookies(&mut self) -> &mut Cookies {
        let secure = self.request.secure();
        let keys = self.env.keys.clone();
        let request = &self.request;
        self.cookies.get_or_insert_with(|| {
            let headers = request.headers().get_all(header::COOKIE);
            Cookies::parse(headers.iter().filter_map(|v| v.to_str().ok()), keys, secure)
        })
    }

    // ── Redirects ────────────────────────────────────────────────────────────

    /// Redirects to `url` with 302, or the current status if it is already
    /// a redirect. The body is a short HTML or text note depending on
    /// `Accept`.
    pub fn redirect(&mut self, url: &str) -> Result<()> {
        let url = encode_url(url);
        self.set_header(header::LOCATION, &url)?;
        if !status::is_redirect(self.status()) {
            self.set_status(302)?;
        }
        if self.accepts(&["html"])?.is_some() {
            let url = escape_html(&url);
            self.set_type("text/html; charset=utf-8")?;
            self.set_body(format!("Redirecting to <a href=\"{url}\">{url}</a>."));
        } else {
            self.set_type("text/plain; charset=utf-8")?;
            self.set_body(format!("Redirecting to {url}."));
        }
        Ok(())
    }

    /// Redirects to the `Referer`, else `alt`, else `/`.
    pub fn back(&mut self, alt: Option<&str>) -> Result<()> {
        let target = self
            .get(header::REFERER)
            .or_else(|| self.get("referrer"))
            .or(alt)
            .unwrap_or("/")
            .to_owned();
        self.redirect(&target)
    }

    // ── Errors ───────────────────────────────────────────────────────────────

    /// An error carrying `status`; return it with `Err(ctx.throw(..))`.
    pub fn throw(&self, status: StatusCode, message: impl Into<String>) -> Error {
        HttpError::new(status, message).into()
    }

    /// `Err(throw(..))` unless `cond` holds.
    pub fn assert(&self, cond: bool, status: StatusCode, message: impl Into<String>) -> Result<()> {
        if cond { Ok(()) } else { Err(self.throw(status, message)) }
    }

    /// Turns a pipeline failure into the response.
    ///
    /// Queued headers and cookies are dropped, the status comes from the
    /// error, and the body is the message for exposed errors or the reason
    /// phrase otherwise. If headers are already on the wire the error is only
    /// reported.
    pub fn on_error(&mut self, err: Error) {
        let code = err.status();
        let exposed = err.expose();
        if code == StatusCode::NOT_FOUND || exposed {
            tracing::debug!(method = %self.method(), path = self.path(), status = code.as_u16(), error = %err, "request error");
        } else {
            self.report(&err);
        }

        if self.headers_sent() {
            return;
        }
        self.response.clear_headers();
        if let Some(jar) = self.cookies.as_mut() {
            jar.take_pending();
        }
        let message = if exposed {
            err.to_string()
        } else {
            match status::message(code) {
                "" => code.as_str().to_owned(),
                reason => reason.to_owned(),
            }
        };
        // `code` comes from a StatusCode, so it is in range.
        let _ = self.response.set_status(code.as_u16());
        self.response.set_builtin_type("text");
        self.response.set_body(message);
    }

    fn report(&self, err: &Error) {
        report(&self.env.verbose, self.method(), self.path(), err);
    }

    // ── Completion ───────────────────────────────────────────────────────────

    /// Runs `f` once the response has been fully written, has failed, or was
    /// abandoned by the client.
    pub fn on_finished(&self, f: impl FnOnce() + Send + 'static) {
        self.finished.subscribe(Box::new(f));
    }

    /// Sends the status line and headers now. The body follows through
    /// [`write`](Self::write) and, after the pipeline, whatever body is
    /// still assigned.
    pub fn flush_headers(&mut self) {
        if self.headers_sent() {
            return;
        }
        let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
        let body = body::into_wire(Body::stream(stream::poll_fn(move |cx| rx.poll_recv(cx))));
        let head = self.build_head(body);
        self.stream_tx = Some(tx);
        self.send_head(head);
    }

    /// Writes a body chunk, flushing headers first if needed.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        self.flush_headers();
        match &self.stream_tx {
            Some(tx) => tx.send(Ok(chunk.into())).await.map_err(|_| closed()),
            None => Err(closed()),
        }
    }

    /// Produces the response once the pipeline has settled.
    pub(crate) async fn respond(&mut self) {
        let code = self.status();
        let bodyless = status::is_empty(code) || self.method() == Method::HEAD;

        if self.headers_sent() {
            let body = self.response.take_body();
            let Some(tx) = self.stream_tx.take() else { return };
            if !bodyless {
                self.pipe(body, tx).await;
            }
            return;
        }

        let body = if status::is_empty(code) {
            self.response.take_body();
            Body::Empty
        } else if self.method() == Method::HEAD {
            if !self.response.has_header(header::CONTENT_LENGTH) {
                if let Some(len) = self.length() {
                    self.set_length(len);
                }
            }
            self.response.take_body();
            Body::Empty
        } else if self.body().is_empty() {
            if self.response.explicit_null_body() {
                self.remove_header(header::CONTENT_TYPE);
                self.remove_header(header::TRANSFER_ENCODING);
                self.set_length(0);
                Body::Empty
            } else {
                let h2 = self.version() == Version::HTTP_2 || self.version() == Version::HTTP_3;
                let text = if h2 || self.message().is_empty() {
                    code.as_str().to_owned()
                } else {
                    self.message().to_owned()
                };
                self.response.set_builtin_type("text");
                self.set_length(text.len() as u64);
                Body::Text(text)
            }
        } else {
            match self.response.take_body() {
                Body::Json(value) => match serde_json::to_vec(&value) {
                    Ok(bytes) => {
                        self.set_length(bytes.len() as u64);
                        Body::Binary(bytes.into())
                    }
                    Err(err) => {
                        self.on_error(err.into());
                        self.response.take_body()
                    }
                },
                Body::Stream(s) => {
                    let (verbose, method, path) = (self.env.verbose.clone(), self.method().clone(), self.path().to_owned());
                    let s = s.into_inner().inspect_err(move |err| report(&verbose, &method, &path, err));
                    Body::stream(s)
                }
                other => other,
            }
        };

        let head = self.build_head(body::into_wire(body));
        self.send_head(head);
    }

    async fn pipe(&self, body: Body, tx: mpsc::Sender<Result<Bytes>>) {
        let chunk = match body {
            Body::Empty => return,
            Body::Text(text) => Bytes::from(text),
            Body::Binary(bytes) => bytes,
            Body::Json(value) => match serde_json::to_vec(&value) {
                Ok(bytes) => bytes.into(),
                Err(err) => {
                    self.report(&err.into());
                    return;
                }
            },
            Body::Stream(s) => {
                let mut s = s.into_inner();
                while let Some(item) = s.next().await {
                    let failed = match &item {
                        Err(err) => {
                            self.report(err);
                            true
                        }
                        Ok(_) => false,
                    };
                    if tx.send(item).await.is_err() || failed {
                        break;
                    }
                }
                return;
            }
        };
        let _ = tx.send(Ok(chunk)).await;
    }

    fn build_head(&mut self, body: UnsyncBoxBody<Bytes, Error>) -> http::Response<ResponseBody> {
        if let Some(jar) = self.cookies.as_mut() {
            for cookie in jar.take_pending() {
                if let Err(err) = self.response.append_header(header::SET_COOKIE, &cookie) {
                    tracing::warn!(error = %err, "dropping unencodable cookie");
                }
            }
        }
        let mut res = http::Response::new(ResponseBody::new(body, self.finished.clone()));
        *res.status_mut() = self.status();
        *res.headers_mut() = self.response.headers().clone();
        self.response.headers_sent = true;
        res
    }

    fn send_head(&mut self, head: http::Response<ResponseBody>) {
        if let Some(tx) = self.head_tx.take() {
            // The receiver is gone when the connection closed first.
            let _ = tx.send(head);
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // A response that was never produced still counts as finished.
        if !self.response.headers_sent {
            self.finished.fire();
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("request", &self.request)
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

fn report(verbose: &Verbose, method: &Method, path: &str, err: &Error) {
    let code = err.status().as_u16();
    tracing::error!(%method, path, status = code, error = %err, "request failed");
    verbose.emit("ctx.error", json!({
        "method": method.as_str(),
        "path": path,
        "status": code,
        "message": err.to_string(),
    }));
}

fn closed() -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "response closed"))
}

/// Bytes left alone in a `Location` header.
const LOCATION: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!').remove(b'#').remove(b'$').remove(b'&').remove(b'\'')
    .remove(b'(').remove(b')').remove(b'*').remove(b'+').remove(b',')
    .remove(b'-').remove(b'.').remove(b'/').remove(b':').remove(b';')
    .remove(b'=').remove(b'?').remove(b'@').remove(b'[').remove(b']')
    .remove(b'_').remove(b'~');

/// Percent-encodes characters not allowed in a URL, keeping existing
/// escapes.
fn encode_url(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    let mut rest = url;
    while let Some(at) = rest.find('%') {
        let (plain, tail) = rest.split_at(at);
        out.extend(utf8_percent_encode(plain, LOCATION));
        let escaped = tail
            .as_bytes()
            .get(1..3)
            .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
        if escaped {
            out.push_str(&tail[..3]);
            rest = &tail[3..];
        } else {
            out.push_str("%25");
            rest = &tail[1..];
        }
    }
    out.extend(utf8_percent_encode(rest, LOCATION));
    out
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
