//! Cookie jar with signed-cookie support over rotated keys.
//!
//! A signed cookie `name=value` travels with a companion `name.sig` cookie
//! holding `HMAC-SHA256(key, "name=value")`, base64url without padding.
//! [`Keygrip`] signs with key 0 and verifies against every key, so a key can
//! be retired by pushing a new one to the front: old signatures still verify
//! and are re-signed with the new key on the way out.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use cookie::{Cookie, SameSite};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

// ── Keygrip ───────────────────────────────────────────────────────────────────

/// Ordered list of signing keys. Index 0 signs; any key verifies.
#[derive(Clone)]
pub struct Keygrip {
    keys: Vec<Vec<u8>>,
}

impl Keygrip {
    pub fn new<I, K>(keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let keys: Vec<Vec<u8>> = keys.into_iter().map(|k| k.as_ref().to_vec()).collect();
        if keys.is_empty() || keys.iter().any(Vec::is_empty) {
            return Err(Error::Config("signing keys must be non-empty".into()));
        }
        Ok(Self { keys })
    }

    pub fn sign(&self, data: &str) -> String {
        URL_SAFE_NO_PAD.encode(mac(&self.keys[0], data).finalize().into_bytes())
    }

    /// Index of the key that produced `digest`, if any.
    pub fn index(&self, data: &str, digest: &str) -> Option<usize> {
        let digest = URL_SAFE_NO_PAD.decode(digest).ok()?;
        self.keys
            .iter()
            .position(|key| mac(key, data).verify_slice(&digest).is_ok())
    }

    pub fn verify(&self, data: &str, digest: &str) -> bool {
        self.index(data, digest).is_some()
    }

    pub fn len(&self) -> usize { self.keys.len() }
    pub fn is_empty(&self) -> bool { self.keys.is_empty() }
}

impl std::fmt::Debug for Keygrip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keygrip").field("keys", &self.keys.len()).finish()
    }
}

fn mac(key: &[u8], data: &str) -> HmacSha256 {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(data.as_bytes());
    mac
}

// ── Options ───────────────────────────────────────────────────────────────────

/// Attributes for an outgoing cookie.
#[derive(Clone, Debug)]
pub struct CookieOptions {
    pub max_age: Option<Duration>,
    pub expires: Option<SystemTime>,
    /// Defaults to `/`.
    pub path: Option<String>,
    pub domain: Option<String>,
    /// Defaults to whether the request arrived over TLS.
    pub secure: Option<bool>,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
    /// Defaults to whether the jar has keys.
    pub signed: Option<bool>,
    /// Replace earlier `Set-Cookie` values for the same name.
    pub overwrite: bool,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            max_age: None,
            expires: None,
            path: None,
            domain: None,
            secure: None,
            http_only: true,
            same_site: None,
            signed: None,
            overwrite: false,
        }
    }
}

// ── Jar ───────────────────────────────────────────────────────────────────────

/// Request cookies plus pending `Set-Cookie` values.
#[derive(Debug)]
pub struct Cookies {
    incoming: Vec<(String, String)>,
    keys: Option<Arc<Keygrip>>,
    secure: bool,
    outgoing: Vec<(String, String)>,
}

impl Cookies {
    /// Parses the request's `Cookie` header values. Malformed pairs are
    /// skipped; the first occurrence of a name wins.
    pub fn parse<'h>(
        headers: impl IntoIterator<Item = &'h str>,
        keys: Option<Arc<Keygrip>>,
        secure: bool,
    ) -> Self {
        let mut incoming: Vec<(String, String)> = Vec::new();
        for header in headers {
            for cookie in Cookie::split_parse(header).flatten() {
                if !incoming.iter().any(|(n, _)| n == cookie.name()) {
                    incoming.push((cookie.name().to_owned(), cookie.value().to_owned()));
                }
            }
        }
        Self { incoming, keys, secure, outgoing: Vec::new() }
    }

    /// Unsigned read.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.incoming
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Signed read: returns the value only if `name.sig` verifies.
    ///
    /// A signature from a rotated-out key is refreshed with the current key;
    /// a bad signature expires the `.sig` cookie.
    pub fn get_signed(&mut self, name: &str) -> Result<Option<String>> {
        let keys = self.keys.clone().ok_or_else(|| Error::Config("keys required for signed cookies".into()))?;
        let Some(value) = self.get(name).map(str::to_owned) else {
            return Ok(None);
        };
        let sig_name = format!("{name}.sig");
        let Some(remote) = self.get(&sig_name).map(str::to_owned) else {
            return Ok(None);
        };
        let data = format!("{name}={value}");
        match keys.index(&data, &remote) {
            None => {
                self.set(&sig_name, None, &CookieOptions { signed: Some(false), ..Default::default() })?;
                Ok(None)
            }
            Some(0) => Ok(Some(value)),
            Some(_) => {
                let fresh = keys.sign(&data);
                self.set(&sig_name, Some(&fresh), &CookieOptions { signed: Some(false), ..Default::default() })?;
                Ok(Some(value))
            }
        }
    }

    /// Queues a `Set-Cookie`. `value = None` deletes the cookie.
    pub fn set(&mut self, name: &str, value: Option<&str>, opts: &CookieOptions) -> Result<()> {
        validate_name(name)?;
        if let Some(v) = value {
            validate_value(v)?;
        }
        if let Some(path) = &opts.path {
            validate_attr("path", path)?;
        }
        if let Some(domain) = &opts.domain {
            validate_attr("domain", domain)?;
        }
        let secure = opts.secure.unwrap_or(self.secure);
        if secure && !self.secure {
            return Err(Error::Config("cannot send secure cookie over unencrypted connection".into()));
        }
        let signed = opts.signed.unwrap_or(self.keys.is_some());
        if signed && self.keys.is_none() {
            return Err(Error::Config("keys required for signed cookies".into()));
        }

        let header = build(name, value.unwrap_or(""), value.is_none(), secure, opts);
        self.push(name, header, opts.overwrite);

        if signed {
            let sig_name = format!("{name}.sig");
            let sig = match (value, &self.keys) {
                (Some(v), Some(keys)) => Some(keys.sign(&format!("{name}={v}"))),
                _ => None,
            };
            let header = build(&sig_name, sig.as_deref().unwrap_or(""), sig.is_none(), secure, opts);
            self.push(&sig_name, header, opts.overwrite);
        }
        Ok(())
    }

    /// `Set-Cookie` header values queued so far, in order.
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.outgoing.iter().map(|(_, h)| h.as_str())
    }

    pub(crate) fn take_pending(&mut self) -> Vec<String> {
        std::mem::take(&mut self.outgoing).into_iter().map(|(_, h)| h).collect()
    }

    fn push(&mut self, name: &str, header: String, overwrite: bool) {
        if overwrite {
            self.outgoing.retain(|(n, _)| n != name);
        }
        self.outgoing.push((name.to_owned(), header));
    }
}

fn build(name: &str, value: &str, expire: bool, secure: bool, opts: &CookieOptions) -> String {
    let mut cookie = Cookie::build((name.to_owned(), value.to_owned()))
        .path(opts.path.clone().unwrap_or_else(|| "/".to_owned()))
        .http_only(opts.http_only)
        .secure(secure)
        .build();
    if let Some(domain) = &opts.domain {
        cookie.set_domain(domain.clone());
    }
    if let Some(same_site) = opts.same_site {
        cookie.set_same_site(same_site);
    }
    if expire {
        cookie.set_expires(cookie::time::OffsetDateTime::UNIX_EPOCH);
    } else {
        if let Some(max_age) = opts.max_age {
            let max_age = cookie::time::Duration::try_from(max_age).unwrap_or(cookie::time::Duration::MAX);
            cookie.set_max_age(max_age);
        }
        if let Some(expires) = opts.expires {
            cookie.set_expires(cookie::time::OffsetDateTime::from(expires));
        }
    }
    cookie.to_string()
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_graphic() && !"()<>@,;:\\\"/[]?={}".contains(c)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(is_token_char) {
        return Err(Error::InvalidCookie { field: "name", value: name.to_owned() });
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<()> {
    let ok = value
        .chars()
        .all(|c| c.is_ascii_graphic() && !matches!(c, '"' | ',' | ';' | '\\'));
    if !ok {
        return Err(Error::InvalidCookie { field: "value", value: value.to_owned() });
    }
    Ok(())
}

fn validate_attr(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() || value.chars().any(|c| c == ';' || c.is_ascii_control()) {
        return Err(Error::InvalidCookie { field, value: value.to_owned() });
    }
    Ok(())
}
