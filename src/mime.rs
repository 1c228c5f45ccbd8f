//! Media-type lookup behind a bounded two-tier cache.
//!
//! `ctx.set_type("json")`, `ctx.accepts(&["html"])` and `ctx.is(&["json"])`
//! all turn a shorthand (`json`, `.json`, `report.json`) or a full media
//! type (`text/plain`) into a normalised `Content-Type`. Extensions are
//! resolved through `mime_guess`; repeating that on every call is wasteful,
//! so results go through a [`TwoTierCache`]:
//!
//! ```text
//! get(k):  hot ──hit──▶ value
//!           │ miss
//!           ▼
//!          cold ──hit──▶ promote into hot ──▶ value
//!           │ miss
//!           ▼
//!          mime_guess, insert into hot
//!
//! insert:  hot.len() == capacity  ⇒  cold = hot, hot = {}
//! ```
//!
//! Eviction is wholesale: the whole hot tier is demoted at once and the old
//! cold tier is discarded. Lookups stay O(1) and the cache never holds more
//! than `2 × capacity` entries.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};

const DEFAULT_CAPACITY: usize = 100;

/// Shorthands that are not file extensions.
const SHORTHANDS: &[(&str, &str)] = &[
    ("form", "application/x-www-form-urlencoded"),
    ("text", "text/plain"),
    ("urlencoded", "application/x-www-form-urlencoded"),
];

// ── Two-tier cache ────────────────────────────────────────────────────────────

/// Bounded map with bulk eviction. See the module docs for the policy.
#[derive(Debug)]
pub struct TwoTierCache<K, V> {
    capacity: usize,
    hot: HashMap<K, V>,
    cold: HashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V: Clone> TwoTierCache<K, V> {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self { capacity, hot: HashMap::new(), cold: HashMap::new() }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        if let Some(v) = self.hot.get(key) {
            return Some(v.clone());
        }
        let v = self.cold.get(key)?.clone();
        self.promote(key.clone(), v.clone());
        Some(v)
    }

    pub fn insert(&mut self, key: K, value: V) {
        if let Some(slot) = self.hot.get_mut(&key) {
            *slot = value;
        } else {
            self.promote(key, value);
        }
    }

    pub fn contains_hot(&self, key: &K) -> bool { self.hot.contains_key(key) }
    pub fn contains_cold(&self, key: &K) -> bool { self.cold.contains_key(key) }

    /// Entries across both tiers (a key may be counted twice).
    pub fn len(&self) -> usize { self.hot.len() + self.cold.len() }
    pub fn is_empty(&self) -> bool { self.hot.is_empty() && self.cold.is_empty() }

    fn promote(&mut self, key: K, value: V) {
        self.hot.insert(key, value);
        if self.hot.len() >= self.capacity {
            self.cold = std::mem::take(&mut self.hot);
        }
    }
}

// ── Resolver ──────────────────────────────────────────────────────────────────

/// Cached shorthand → `Content-Type` resolution.
#[derive(Debug)]
pub struct MediaTypes {
    content_types: Mutex<TwoTierCache<String, Option<String>>>,
    essences: Mutex<TwoTierCache<String, Option<String>>>,
    scans: AtomicUsize,
}

static SHARED: LazyLock<MediaTypes> = LazyLock::new(|| MediaTypes::new(DEFAULT_CAPACITY));

/// Process-wide resolver used by [`Context`](crate::Context).
pub fn shared() -> &'static MediaTypes {
    &SHARED
}

impl MediaTypes {
    pub fn new(capacity: usize) -> Self {
        Self {
            content_types: Mutex::new(TwoTierCache::new(capacity)),
            essences: Mutex::new(TwoTierCache::new(capacity)),
            scans: AtomicUsize::new(0),
        }
    }

    /// Full `Content-Type` for `ty`, charset included for text-like types.
    ///
    /// `Ok(None)` means the shorthand is unknown; a malformed full media type
    /// is an error.
    ///
    /// ```rust
    /// let types = wharf::mime::MediaTypes::new(8);
    /// assert_eq!(types.content_type("json").unwrap().as_deref(), Some("application/json; charset=utf-8"));
    /// assert_eq!(types.content_type("png").unwrap().as_deref(), Some("image/png"));
    /// assert_eq!(types.content_type("nope").unwrap(), None);
    /// assert!(types.content_type("text/pl@in").is_err());
    /// ```
    pub fn content_type(&self, ty: &str) -> Result<Option<String>> {
        if let Some(hit) = self.content_types.lock().get(&ty.to_owned()) {
            return Ok(hit);
        }
        let resolved = self.essence_uncached(ty)?.map(|essence| {
            let full = if ty.contains('/') { ty.trim() } else { essence.as_str() };
            if has_charset(full) { full.to_owned() } else { with_charset(&essence, full) }
        });
        self.content_types.lock().insert(ty.to_owned(), resolved.clone());
        Ok(resolved)
    }

    /// Bare media type (`type/subtype`) for `ty`, without parameters.
    pub fn lookup(&self, ty: &str) -> Result<Option<String>> {
        if let Some(hit) = self.essences.lock().get(&ty.to_owned()) {
            return Ok(hit);
        }
        let resolved = self.essence_uncached(ty)?;
        self.essences.lock().insert(ty.to_owned(), resolved.clone());
        Ok(resolved)
    }

    /// Number of extension lookups that missed both cache tiers.
    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::Relaxed)
    }

    fn essence_uncached(&self, ty: &str) -> Result<Option<String>> {
        let ty = ty.trim();
        if ty.contains('/') {
            let parsed: mime::Mime = ty.parse().map_err(|_| Error::InvalidMediaType(ty.to_owned()))?;
            return Ok(Some(parsed.essence_str().to_owned()));
        }
        self.scans.fetch_add(1, Ordering::Relaxed);
        let ext = extension(ty);
        if let Some((_, essence)) = SHORTHANDS.iter().find(|(name, _)| *name == ext) {
            return Ok(Some((*essence).to_owned()));
        }
        Ok(mime_guess::from_ext(&ext).first().map(|m| m.essence_str().to_owned()))
    }
}

/// `json`, `.json`, `a/b.JSON` → `json`.
fn extension(ty: &str) -> String {
    let name = ty.rsplit(['/', '\\']).next().unwrap_or(ty);
    name.rsplit('.').next().unwrap_or(name).to_ascii_lowercase()
}

fn has_charset(full: &str) -> bool {
    full.to_ascii_lowercase().contains("charset=")
}

fn with_charset(essence: &str, full: &str) -> String {
    if is_textual(essence) {
        format!("{full}; charset=utf-8")
    } else {
        full.to_owned()
    }
}

fn is_textual(essence: &str) -> bool {
    essence.starts_with("text/")
        || essence == "application/json"
        || essence == "application/javascript"
        || essence.ends_with("+json")
}
