//! Response half of the context.
//!
//! Assigning a body or a status has knock-on effects on the other and on the
//! entity headers:
//!
//! | Assignment | Status | Headers |
//! |---|---|---|
//! | text | 200 unless set explicitly | `text/html` if it starts with `<`, else `text/plain`; length |
//! | binary | 200 unless set explicitly | `application/octet-stream`; length |
//! | stream | 200 unless set explicitly | `application/octet-stream`; replacing a body drops the length |
//! | JSON | 200 unless set explicitly | `application/json`; no length until flush |
//! | empty | 204 unless already body-less | type, length and transfer-encoding removed |
//! | 204 / 205 / 304 status | — | body cleared as above |
//!
//! Content types are only filled in when none is set. Once headers are sent
//! every mutation here is silently ignored.

use std::time::SystemTime;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::body::Body;
use crate::error::{Error, Result};
use crate::{mime, status};

/// Outgoing response state.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
    explicit_status: bool,
    explicit_null_body: bool,
    pub(crate) headers_sent: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            headers: HeaderMap::new(),
            body: Body::Empty,
            explicit_status: false,
            explicit_null_body: false,
            headers_sent: false,
        }
    }
}

impl Response {
    pub fn status(&self) -> StatusCode { self.status }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &Body { &self.body }
    pub fn headers_sent(&self) -> bool { self.headers_sent }

    /// Reason phrase for the current status.
    pub fn message(&self) -> &'static str {
        status::message(self.status)
    }

    pub(crate) fn explicit_null_body(&self) -> bool { self.explicit_null_body }

    /// Sets the status. Codes outside 100–999 are rejected; a body-less code
    /// clears the body.
    pub fn set_status(&mut self, code: u16) -> Result<()> {
        if self.headers_sent {
            return Ok(());
        }
        let code = status::validate(code)?;
        self.explicit_status = true;
        self.status = code;
        if status::is_empty(code) && !self.body.is_empty() {
            self.set_body(Body::Empty);
        }
        Ok(())
    }

    /// Replaces the body; see the module docs for the side effects.
    pub fn set_body(&mut self, body: impl Into<Body>) {
        let body = body.into();
        let had_body = !self.body.is_empty();

        if body.is_empty() {
            self.body = body;
            if !status::is_empty(self.status) && !self.headers_sent {
                self.status = StatusCode::NO_CONTENT;
                self.explicit_status = true;
            }
            self.explicit_null_body = true;
            self.remove_header(header::CONTENT_TYPE);
            self.remove_header(header::CONTENT_LENGTH);
            self.remove_header(header::TRANSFER_ENCODING);
            return;
        }

        if !self.explicit_status && !self.headers_sent {
            self.status = StatusCode::OK;
        }
        self.explicit_null_body = false;
        let set_type = !self.headers.contains_key(header::CONTENT_TYPE);

        match &body {
            Body::Text(text) => {
                if set_type {
                    let html = text.trim_start().starts_with('<');
                    self.set_builtin_type(if html { "html" } else { "text" });
                }
                self.set_length(text.len() as u64);
            }
            Body::Binary(bytes) => {
                if set_type {
                    self.set_builtin_type("bin");
                }
                self.set_length(bytes.len() as u64);
            }
            Body::Stream(_) => {
                if had_body {
                    self.remove_header(header::CONTENT_LENGTH);
                }
                if set_type {
                    self.set_builtin_type("bin");
                }
            }
            Body::Json(_) => {
                self.remove_header(header::CONTENT_LENGTH);
                self.set_builtin_type("json");
            }
            Body::Empty => unreachable!("handled above"),
        }
        self.body = body;
    }

    pub(crate) fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    /// `Content-Length` if set, else the body's own length. `None` for
    /// streams and for no body at all.
    pub fn length(&self) -> Option<u64> {
        if let Some(len) = self.header(header::CONTENT_LENGTH) {
            return len.trim().parse().ok();
        }
        match &self.body {
            Body::Empty | Body::Stream(_) => None,
            body => body.len(),
        }
    }

    /// Sets `Content-Length` unless the response is chunked.
    pub fn set_length(&mut self, len: u64) {
        if !self.headers.contains_key(header::TRANSFER_ENCODING) {
            self.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }
    }

    /// Response `Content-Type`.
    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE)
    }

    /// Sets `Content-Type` from an extension or full media type. Unknown
    /// extensions remove the header.
    pub fn set_type(&mut self, ty: &str) -> Result<()> {
        match mime::shared().content_type(ty)? {
            Some(full) => self.set_header(header::CONTENT_TYPE, &full),
            None => {
                self.remove_header(header::CONTENT_TYPE);
                Ok(())
            }
        }
    }

    /// For the built-in shorthands, which always resolve.
    pub(crate) fn set_builtin_type(&mut self, ty: &str) {
        if let Ok(Some(full)) = mime::shared().content_type(ty) {
            if let Ok(value) = HeaderValue::from_str(&full) {
                self.insert(header::CONTENT_TYPE, value);
            }
        }
    }

    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn has_header(&self, name: impl header::AsHeaderName) -> bool {
        self.headers.contains_key(name)
    }

    pub fn set_header<K>(&mut self, name: K, value: &str) -> Result<()>
    where
        K: TryInto<HeaderName>,
        K::Error: std::fmt::Display,
    {
        let (name, value) = pair(name, value)?;
        self.insert(name, value);
        Ok(())
    }

    pub fn append_header<K>(&mut self, name: K, value: &str) -> Result<()>
    where
        K: TryInto<HeaderName>,
        K::Error: std::fmt::Display,
    {
        let (name, value) = pair(name, value)?;
        if !self.headers_sent {
            self.headers.append(name, value);
        }
        Ok(())
    }

    pub fn remove_header(&mut self, name: impl header::AsHeaderName) {
        if !self.headers_sent {
            self.headers.remove(name);
        }
    }

    /// Removes every queued header.
    pub(crate) fn clear_headers(&mut self) {
        if !self.headers_sent {
            self.headers.clear();
        }
    }

    fn insert(&mut self, name: HeaderName, value: HeaderValue) {
        if !self.headers_sent {
            self.headers.insert(name, value);
        }
    }

    /// Adds `field` to `Vary` once. `*` absorbs everything.
    pub fn vary(&mut self, field: &str) -> Result<()> {
        let field = field.trim();
        let current = self.header(header::VARY).unwrap_or("").to_owned();
        if current.trim() == "*" {
            return Ok(());
        }
        if field == "*" {
            return self.set_header(header::VARY, "*");
        }
        let present = current
            .split(',')
            .any(|f| f.trim().eq_ignore_ascii_case(field));
        if present {
            return Ok(());
        }
        let value = if current.trim().is_empty() { field.to_owned() } else { format!("{current}, {field}") };
        self.set_header(header::VARY, &value)
    }

    /// Sets `ETag`, quoting bare values. Weak (`W/"…"`) and quoted values
    /// are kept as given.
    pub fn set_etag(&mut self, etag: &str) -> Result<()> {
        if etag.starts_with('"') || etag.starts_with("W/\"") {
            self.set_header(header::ETAG, etag)
        } else {
            self.set_header(header::ETAG, &format!("\"{etag}\""))
        }
    }

    pub fn etag(&self) -> Option<&str> {
        self.header(header::ETAG)
    }

    pub fn set_last_modified(&mut self, at: SystemTime) -> Result<()> {
        self.set_header(header::LAST_MODIFIED, &httpdate::fmt_http_date(at))
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.header(header::LAST_MODIFIED)
            .and_then(|v| httpdate::parse_http_date(v).ok())
    }

    /// Marks the response as a download. With a filename, the type follows
    /// its extension and the name travels in `Content-Disposition`, RFC 5987
    /// encoded when it is not plain ASCII.
    pub fn attachment(&mut self, filename: Option<&str>) -> Result<()> {
        let Some(filename) = filename else {
            return self.set_header(header::CONTENT_DISPOSITION, "attachment");
        };
        let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
        self.set_type(name)?;
        self.set_header(header::CONTENT_DISPOSITION, &content_disposition(name))
    }
}

fn pair<K>(name: K, value: &str) -> Result<(HeaderName, HeaderValue)>
where
    K: TryInto<HeaderName>,
    K::Error: std::fmt::Display,
{
    let name = name.try_into().map_err(|e| Error::InvalidHeader(e.to_string()))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| Error::InvalidHeader(format!("{name}: {value:?}")))?;
    Ok((name, value))
}

fn content_disposition(name: &str) -> String {
    let plain = name
        .chars()
        .all(|c| (' '..='~').contains(&c) && c != '"' && c != '\\' && c != '%');
    if plain {
        return format!("attachment; filename=\"{name}\"");
    }
    let fallback: String = name
        .chars()
        .map(|c| if (' '..='~').contains(&c) && c != '"' && c != '\\' { c } else { '?' })
        .collect();
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{}", rfc5987(name))
}

/// RFC 5987 `attr-char`: everything else is percent-encoded.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!').remove(b'#').remove(b'$').remove(b'&').remove(b'+')
    .remove(b'-').remove(b'.').remove(b'^').remove(b'_').remove(b'`')
    .remove(b'|').remove(b'~');

fn rfc5987(value: &str) -> String {
    utf8_percent_encode(value, ATTR_CHAR).to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use futures_util::stream;

    use super::*;

    fn content_type(res: &Response) -> &str {
        res.content_type().unwrap_or("")
    }

    #[test]
    fn defaults_to_404_without_body() {
        let res = Response::default();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(res.body().is_empty());
        assert_eq!(res.length(), None);
    }

    #[test]
    fn text_sniffs_html() {
        let mut res = Response::default();
        res.set_body("  \n<p>hi</p>");
        assert_eq!(content_type(&res), "text/html; charset=utf-8");
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.length(), Some(12));

        let mut res = Response::default();
        res.set_body("plain <b>");
        assert_eq!(content_type(&res), "text/plain; charset=utf-8");
    }

    #[test]
    fn existing_type_is_kept() {
        let mut res = Response::default();
        res.set_type("svg").unwrap();
        res.set_body("<svg/>");
        assert_eq!(content_type(&res), "image/svg+xml");
    }

    #[test]
    fn binary_and_json() {
        let mut res = Response::default();
        res.set_body(Bytes::from_static(b"\x00\x01"));
        assert_eq!(content_type(&res), "application/octet-stream");
        assert_eq!(res.length(), Some(2));

        res.set_body(serde_json::json!({"ok": true}));
        assert_eq!(content_type(&res), "application/json; charset=utf-8");
        assert!(!res.has_header(header::CONTENT_LENGTH));
        assert_eq!(res.length(), Some(11));
    }

    #[test]
    fn malformed_content_length_is_unknown() {
        let mut res = Response::default();
        res.set_body("abc");
        res.set_header(header::CONTENT_LENGTH, "3 bytes").unwrap();
        assert_eq!(res.length(), None);
        res.set_header(header::CONTENT_LENGTH, " 3 ").unwrap();
        assert_eq!(res.length(), Some(3));
    }

    #[test]
    fn replacing_with_stream_drops_length() {
        let mut res = Response::default();
        res.set_body("abc");
        res.set_body(Body::stream(stream::empty()));
        assert!(!res.has_header(header::CONTENT_LENGTH));
        assert_eq!(res.length(), None);
    }

    #[test]
    fn null_body_sets_204_unless_bodyless() {
        let mut res = Response::default();
        res.set_body("x");
        res.set_body(None::<String>);
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert!(res.explicit_null_body());
        assert!(!res.has_header(header::CONTENT_TYPE));
        assert!(!res.has_header(header::CONTENT_LENGTH));

        let mut res = Response::default();
        res.set_status(304).unwrap();
        res.set_body(Body::Empty);
        assert_eq!(res.status(), StatusCode::NOT_MODIFIED);
    }

    #[test]
    fn explicit_status_survives_body() {
        let mut res = Response::default();
        res.set_status(201).unwrap();
        res.set_body("made");
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    #[test]
    fn bodyless_status_clears_body() {
        let mut res = Response::default();
        res.set_body("gone");
        res.set_status(204).unwrap();
        assert!(res.body().is_empty());
        assert!(!res.has_header(header::CONTENT_TYPE));
    }

    #[test]
    fn status_bounds_fail_fast() {
        let mut res = Response::default();
        assert!(matches!(res.set_status(42), Err(Error::InvalidStatus(42))));
        assert!(matches!(res.set_status(1000), Err(Error::InvalidStatus(1000))));
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn mutations_after_headers_sent_are_ignored() {
        let mut res = Response::default();
        res.set_body("a");
        res.headers_sent = true;
        res.set_status(500).unwrap();
        res.set_header("x-late", "1").unwrap();
        res.remove_header(header::CONTENT_TYPE);
        assert_eq!(res.status(), StatusCode::OK);
        assert!(!res.has_header("x-late"));
        assert!(res.has_header(header::CONTENT_TYPE));
    }

    #[test]
    fn malformed_headers_error() {
        let mut res = Response::default();
        assert!(matches!(res.set_header("bad header", "v"), Err(Error::InvalidHeader(_))));
        assert!(matches!(res.set_header("x-ok", "line\nbreak"), Err(Error::InvalidHeader(_))));
        assert!(res.set_type("text/pl@in").is_err());
    }

    #[test]
    fn vary_dedupes() {
        let mut res = Response::default();
        res.vary("Accept").unwrap();
        res.vary("accept").unwrap();
        res.vary("Origin").unwrap();
        assert_eq!(res.header(header::VARY), Some("Accept, Origin"));
        res.vary("*").unwrap();
        res.vary("Cookie").unwrap();
        assert_eq!(res.header(header::VARY), Some("*"));
    }

    #[test]
    fn etag_and_last_modified() {
        let mut res = Response::default();
        res.set_etag("abc").unwrap();
        assert_eq!(res.etag(), Some("\"abc\""));
        res.set_etag("W/\"weak\"").unwrap();
        assert_eq!(res.etag(), Some("W/\"weak\""));

        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(946_684_800);
        res.set_last_modified(at).unwrap();
        assert_eq!(res.header(header::LAST_MODIFIED), Some("Sat, 01 Jan 2000 00:00:00 GMT"));
        assert_eq!(res.last_modified(), Some(at));
    }

    #[test]
    fn attachment_encodes_names() {
        let mut res = Response::default();
        res.attachment(Some("reports/q1.pdf")).unwrap();
        assert_eq!(content_type(&res), "application/pdf");
        assert_eq!(res.header(header::CONTENT_DISPOSITION), Some("attachment; filename=\"q1.pdf\""));

        res.attachment(Some("résumé.txt")).unwrap();
        assert_eq!(
            res.header(header::CONTENT_DISPOSITION),
            Some("attachment; filename=\"r?sum?.txt\"; filename*=UTF-8''r%C3%A9sum%C3%A9.txt"),
        );

        res.attachment(Some("50% off [final].txt")).unwrap();
        assert_eq!(
            res.header(header::CONTENT_DISPOSITION),
            Some("attachment; filename=\"50% off [final].txt\"; filename*=UTF-8''50%25%20off%20%5Bfinal%5D.txt"),
        );
    }
}
