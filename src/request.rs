//! Request half of the context.

use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;

use bytes::Bytes;
use http::header::{self, HeaderMap};
use http::{Method, Uri, Version};
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use parking_lot::Mutex;

use crate::error::{BoxError, Error, Result};
use crate::negotiate;

/// Request body as stored on the context.
pub type RequestBody = UnsyncBoxBody<Bytes, Error>;

/// An incoming HTTP request: head, body and connection facts.
///
/// Behind a trusted proxy (`proxy = true`) the `X-Forwarded-*` headers
/// override what the socket reports for host, protocol and client address.
pub struct Request {
    head: http::request::Parts,
    body: Mutex<Option<RequestBody>>,
    collected: Option<Bytes>,
    peer: Option<SocketAddr>,
    tls: bool,
    proxy: bool,
    query: OnceLock<Vec<(String, String)>>,
}

impl Request {
    pub(crate) fn new<B>(req: http::Request<B>) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (head, body) = req.into_parts();
        let body = body.map_err(|e| Error::Body(e.into())).boxed_unsync();
        Self {
            head,
            body: Mutex::new(Some(body)),
            collected: None,
            peer: None,
            tls: false,
            proxy: false,
            query: OnceLock::new(),
        }
    }

    pub(crate) fn connect(&mut self, peer: Option<SocketAddr>, tls: bool, proxy: bool) {
        self.peer = peer;
        self.tls = tls;
        self.proxy = proxy;
    }

    pub fn method(&self) -> &Method { &self.head.method }
    pub fn uri(&self) -> &Uri { &self.head.uri }
    pub fn version(&self) -> Version { self.head.version }
    pub fn headers(&self) -> &HeaderMap { &self.head.headers }
    pub fn path(&self) -> &str { self.head.uri.path() }
    pub fn peer_addr(&self) -> Option<SocketAddr> { self.peer }

    /// Raw query string without the `?`, or `""`.
    pub fn querystring(&self) -> &str {
        self.head.uri.query().unwrap_or("")
    }

    /// Decoded query pairs, parsed on first use.
    pub fn query(&self) -> &[(String, String)] {
        self.query.get_or_init(|| {
            url::form_urlencoded::parse(self.querystring().as_bytes())
                .into_owned()
                .collect()
        })
    }

    /// First value of query parameter `name`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query()
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Header value as text. Missing or non-visible-ASCII values are `None`.
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `Host`, `:authority` on HTTP/2, or `X-Forwarded-Host` behind a proxy.
    pub fn host(&self) -> Option<&str> {
        if self.proxy {
            if let Some(forwarded) = self.header("x-forwarded-host") {
                return first_list_item(forwarded);
            }
        }
        if self.head.version == Version::HTTP_2 || self.head.version == Version::HTTP_3 {
            if let Some(authority) = self.head.uri.authority() {
                return Some(authority.as_str());
            }
        }
        self.header(header::HOST)
            .or_else(|| self.head.uri.authority().map(|a| a.as_str()))
    }

    /// [`host`](Self::host) without the port. IPv6 literals keep their
    /// brackets.
    pub fn hostname(&self) -> Option<&str> {
        let host = self.host()?;
        if host.starts_with('[') {
            return host.find(']').map(|end| &host[..=end]);
        }
        Some(host.split(':').next().unwrap_or(host))
    }

    /// `"https"` over TLS, `X-Forwarded-Proto` behind a proxy, else `"http"`.
    pub fn protocol(&self) -> &str {
        if self.tls {
            return "https";
        }
        if self.proxy {
            if let Some(proto) = self.header("x-forwarded-proto").and_then(first_list_item) {
                return proto;
            }
        }
        "http"
    }

    pub fn secure(&self) -> bool {
        self.protocol().eq_ignore_ascii_case("https")
    }

    /// Client chain from `X-Forwarded-For` (behind a proxy only), client
    /// first. Unparseable entries are skipped.
    pub fn ips(&self) -> Vec<IpAddr> {
        if !self.proxy {
            return Vec::new();
        }
        self.header("x-forwarded-for")
            .map(|xff| xff.split(',').filter_map(|ip| ip.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    /// Originating client address.
    pub fn ip(&self) -> Option<IpAddr> {
        self.ips().first().copied().or(self.peer.map(|p| p.ip()))
    }

    /// Request `Content-Type`.
    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header(header::CONTENT_LENGTH)?.trim().parse().ok()
    }

    /// Whether the request announces a body.
    pub fn has_body(&self) -> bool {
        self.head.headers.contains_key(header::TRANSFER_ENCODING) || self.content_length().is_some()
    }

    /// Matches the request `Content-Type` against `types`.
    ///
    /// `types` may hold extensions (`json`), full types (`text/html`),
    /// wildcards (`text/*`), suffixes (`+json`) and the `urlencoded` and
    /// `multipart` shorthands. Returns the matching entry, or the actual
    /// type when the entry was a pattern. A request without a body matches
    /// nothing. With empty `types` the actual type is returned.
    pub fn is(&self, types: &[&str]) -> Result<Option<String>> {
        if !self.has_body() {
            return Ok(None);
        }
        match self.content_type() {
            Some(actual) => negotiate::type_is(actual, types),
            None => Ok(None),
        }
    }

    /// Collects the whole body. Later calls return the same bytes.
    pub async fn body_bytes(&mut self) -> Result<Bytes> {
        if let Some(bytes) = &self.collected {
            return Ok(bytes.clone());
        }
        let bytes = match self.body.get_mut().take() {
            Some(body) => body.collect().await?.to_bytes(),
            None => Bytes::new(),
        };
        self.collected = Some(bytes.clone());
        Ok(bytes)
    }

    /// Takes the raw body for streaming consumption.
    pub fn take_body(&mut self) -> Option<RequestBody> {
        self.body.get_mut().take()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.head.method)
            .field("uri", &self.head.uri)
            .field("version", &self.head.version)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

fn first_list_item(value: &str) -> Option<&str> {
    value.split(',').next().map(str::trim).filter(|s| !s.is_empty())
}
