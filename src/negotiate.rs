//! Content negotiation over `Accept`, `Accept-Encoding`, `Accept-Charset`
//! and `Accept-Language`, plus `Content-Type` matching.
//!
//! Each header is parsed into ranges with a quality (`q`) and a position.
//! A provided value takes the priority of the most specific range matching
//! it; values are then ordered by quality, specificity, header position and
//! finally the order they were provided in. Values whose best range has
//! `q=0` are not acceptable.

use std::cmp::Ordering;

use crate::error::Result;
use crate::mime;

/// One parsed header entry.
#[derive(Clone, Debug, PartialEq)]
struct Range {
    /// Full value as written (`text/html`, `gzip`, `en-US`).
    value: String,
    params: Vec<(String, String)>,
    q: f32,
    index: usize,
}

/// Winning range for a provided value.
#[derive(Clone, Copy, Debug)]
struct Priority {
    provided: usize,
    index: usize,
    q: f32,
    specificity: u8,
}

fn parse_ranges(header: &str) -> Vec<Range> {
    header
        .split(',')
        .enumerate()
        .filter_map(|(index, entry)| {
            let mut parts = entry.split(';').map(str::trim);
            let value = parts.next().filter(|v| !v.is_empty())?.to_owned();
            let mut q = 1.0;
            let mut params = Vec::new();
            for param in parts {
                let (k, v) = param.split_once('=')?;
                let (k, v) = (k.trim().to_ascii_lowercase(), v.trim().trim_matches('"'));
                if k == "q" {
                    q = v.parse::<f32>().ok().filter(|q| (0.0..=1.0).contains(q))?;
                } else {
                    params.push((k, v.to_owned()));
                }
            }
            Some(Range { value, params, q, index })
        })
        .collect()
}

/// Orders `provided` by their best range; drops unacceptable ones.
fn rank<F>(provided: &[&str], ranges: &[Range], specify: F) -> Vec<usize>
where
    F: Fn(&str, &Range) -> Option<u8>,
{
    let mut ranked: Vec<Priority> = provided
        .iter()
        .enumerate()
        .filter_map(|(i, value)| {
            ranges
                .iter()
                .filter_map(|range| {
                    specify(value, range).map(|specificity| Priority {
                        provided: i,
                        index: range.index,
                        q: range.q,
                        specificity,
                    })
                })
                .reduce(|best, p| {
                    let better = p.specificity.cmp(&best.specificity)
                        .then(p.q.total_cmp(&best.q))
                        .then(p.index.cmp(&best.index));
                    if better == Ordering::Greater { p } else { best }
                })
        })
        .filter(|p| p.q > 0.0)
        .collect();

    ranked.sort_by(|a, b| {
        b.q.total_cmp(&a.q)
            .then(b.specificity.cmp(&a.specificity))
            .then(a.index.cmp(&b.index))
            .then(a.provided.cmp(&b.provided))
    });
    ranked.into_iter().map(|p| p.provided).collect()
}

/// Ranges in preference order, `q=0` dropped.
fn preferred(ranges: &[Range]) -> Vec<String> {
    let mut ranges: Vec<&Range> = ranges.iter().filter(|r| r.q > 0.0).collect();
    ranges.sort_by(|a, b| b.q.total_cmp(&a.q).then(a.index.cmp(&b.index)));
    ranges.into_iter().map(|r| r.value.clone()).collect()
}

// ── Accept ────────────────────────────────────────────────────────────────────

/// Parsed `Accept` header. A missing header accepts everything.
#[derive(Clone, Debug)]
pub struct Accept {
    ranges: Vec<Range>,
}

impl Accept {
    pub fn parse(header: Option<&str>) -> Self {
        Self { ranges: parse_ranges(header.unwrap_or("*/*")) }
    }

    /// Accepted media ranges, most preferred first.
    pub fn preferred(&self) -> Vec<String> {
        preferred(&self.ranges)
    }

    /// Best of `types` for this header. Entries may be extensions (`json`) or
    /// full types; the entry is returned as given. Unknown extensions never
    /// match.
    pub fn negotiate<'t>(&self, types: &[&'t str]) -> Result<Option<&'t str>> {
        let mut known: Vec<(&'t str, String)> = Vec::with_capacity(types.len());
        for &ty in types {
            if let Some(essence) = resolve(ty)? {
                known.push((ty, essence));
            }
        }
        let essences: Vec<&str> = known.iter().map(|(_, e)| e.as_str()).collect();
        Ok(rank(&essences, &self.ranges, specify_media)
            .first()
            .map(|&i| known[i].0))
    }
}

fn resolve(ty: &str) -> Result<Option<String>> {
    if ty.contains('/') {
        Ok(Some(ty.trim().to_ascii_lowercase()))
    } else {
        mime::shared().lookup(ty)
    }
}

fn split_media(value: &str) -> Option<(&str, &str)> {
    let essence = value.split(';').next()?.trim();
    let (ty, subtype) = essence.split_once('/')?;
    (!ty.is_empty() && !subtype.is_empty()).then_some((ty, subtype))
}

fn specify_media(provided: &str, range: &Range) -> Option<u8> {
    let (ty, subtype) = split_media(provided)?;
    let (rty, rsub) = split_media(&range.value)?;
    let mut s = 0;
    if rty.eq_ignore_ascii_case(ty) {
        s |= 4;
    } else if rty != "*" {
        return None;
    }
    if rsub.eq_ignore_ascii_case(subtype) {
        s |= 2;
    } else if rsub != "*" {
        return None;
    }
    if !range.params.is_empty() {
        // `provided` is a bare essence; only wildcard params can match.
        if range.params.iter().all(|(_, v)| v == "*") {
            s |= 1;
        } else {
            return None;
        }
    }
    Some(s)
}

// ── Encodings, charsets, languages ────────────────────────────────────────────

/// Best of `encodings` for an `Accept-Encoding` header. `identity` is
/// acceptable unless explicitly refused.
pub fn encodings<'t>(header: Option<&str>, encodings: &[&'t str]) -> Option<&'t str> {
    let mut ranges = parse_ranges(header.unwrap_or(""));
    let has_identity = ranges
        .iter()
        .any(|r| r.value.eq_ignore_ascii_case("identity") || r.value == "*");
    if !has_identity {
        let min_q = ranges.iter().map(|r| r.q).fold(1.0, f32::min);
        ranges.push(Range { value: "identity".into(), params: Vec::new(), q: min_q, index: ranges.len() });
    }
    first(encodings, rank(encodings, &ranges, specify_token))
}

/// Best of `charsets` for an `Accept-Charset` header.
pub fn charsets<'t>(header: Option<&str>, charsets: &[&'t str]) -> Option<&'t str> {
    let ranges = parse_ranges(header.unwrap_or("*"));
    first(charsets, rank(charsets, &ranges, specify_token))
}

/// Best of `languages` for an `Accept-Language` header. `en` matches `en-US`
/// and the other way round, at lower specificity than an exact match.
pub fn languages<'t>(header: Option<&str>, languages: &[&'t str]) -> Option<&'t str> {
    let ranges = parse_ranges(header.unwrap_or("*"));
    first(languages, rank(languages, &ranges, specify_language))
}

/// Values listed in a header, most preferred first.
pub fn preferred_values(header: Option<&str>, default: &str) -> Vec<String> {
    preferred(&parse_ranges(header.unwrap_or(default)))
}

fn first<'t>(values: &[&'t str], ranked: Vec<usize>) -> Option<&'t str> {
    ranked.first().map(|&i| values[i])
}

fn specify_token(provided: &str, range: &Range) -> Option<u8> {
    if range.value.eq_ignore_ascii_case(provided) {
        Some(1)
    } else if range.value == "*" {
        Some(0)
    } else {
        None
    }
}

fn specify_language(provided: &str, range: &Range) -> Option<u8> {
    let prefix = |tag: &str| tag.split('-').next().unwrap_or(tag).to_owned();
    if range.value.eq_ignore_ascii_case(provided) {
        Some(4)
    } else if prefix(&range.value).eq_ignore_ascii_case(provided) {
        Some(2)
    } else if range.value.eq_ignore_ascii_case(&prefix(provided)) {
        Some(1)
    } else if range.value == "*" {
        Some(0)
    } else {
        None
    }
}

// ── Content-Type matching ─────────────────────────────────────────────────────

/// Matches an actual `Content-Type` against `types` (see
/// [`Request::is`](crate::Request::is)).
pub fn type_is(actual: &str, types: &[&str]) -> Result<Option<String>> {
    let Ok(parsed) = actual.trim().parse::<::mime::Mime>() else {
        return Ok(None);
    };
    let actual = parsed.essence_str().to_ascii_lowercase();
    if types.is_empty() {
        return Ok(Some(actual));
    }
    for &ty in types {
        let Some(expected) = normalize(ty)? else { continue };
        if media_match(&expected, &actual) {
            let pattern = ty.starts_with('+') || ty.contains('*');
            return Ok(Some(if pattern { actual } else { ty.to_owned() }));
        }
    }
    Ok(None)
}

fn normalize(ty: &str) -> Result<Option<String>> {
    Ok(match ty {
        "urlencoded" => Some("application/x-www-form-urlencoded".into()),
        "multipart" => Some("multipart/*".into()),
        _ if ty.starts_with('+') => Some(format!("*/*{ty}")),
        _ if ty.contains('/') => Some(ty.to_ascii_lowercase()),
        _ => mime::shared().lookup(ty)?,
    })
}

fn media_match(expected: &str, actual: &str) -> bool {
    let (Some((ety, esub)), Some((aty, asub))) = (expected.split_once('/'), actual.split_once('/')) else {
        return false;
    };
    if ety != "*" && ety != aty {
        return false;
    }
    if let Some(suffix) = esub.strip_prefix("*+") {
        return asub.len() > suffix.len() && asub.ends_with(suffix) && asub[..asub.len() - suffix.len()].ends_with('+');
    }
    esub == "*" || esub == asub
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_prefers_quality_then_specificity() {
        let accept = Accept::parse(Some("text/*;q=0.5, application/json, text/html"));
        assert_eq!(accept.negotiate(&["text/plain", "json"]).unwrap(), Some("json"));
        assert_eq!(accept.negotiate(&["text/plain", "html"]).unwrap(), Some("html"));
        assert_eq!(accept.negotiate(&["text/plain"]).unwrap(), Some("text/plain"));
        assert_eq!(accept.negotiate(&["image/png"]).unwrap(), None);
        assert_eq!(accept.preferred(), ["application/json", "text/html", "text/*"]);
    }

    #[test]
    fn missing_accept_takes_first_offer() {
        let accept = Accept::parse(None);
        assert_eq!(accept.negotiate(&["html", "json"]).unwrap(), Some("html"));
        assert_eq!(accept.negotiate(&["nonsense-ext"]).unwrap(), None);
    }

    #[test]
    fn q_zero_refuses() {
        let accept = Accept::parse(Some("*/*, text/html;q=0"));
        assert_eq!(accept.negotiate(&["html", "json"]).unwrap(), Some("json"));
    }

    #[test]
    fn encodings_keep_identity() {
        assert_eq!(encodings(None, &["gzip", "identity"]), Some("identity"));
        assert_eq!(encodings(Some("gzip, deflate"), &["deflate", "gzip"]), Some("gzip"));
        assert_eq!(encodings(Some("br;q=0.8, gzip"), &["br", "gzip"]), Some("gzip"));
        assert_eq!(encodings(Some("gzip, identity;q=0"), &["identity"]), None);
    }

    #[test]
    fn charsets_and_languages() {
        assert_eq!(charsets(Some("utf-8, iso-8859-1;q=0.2"), &["iso-8859-1", "utf-8"]), Some("utf-8"));
        assert_eq!(charsets(None, &["utf-8"]), Some("utf-8"));

        let header = Some("en;q=0.8, es, pt-BR");
        assert_eq!(languages(header, &["en-US", "es"]), Some("es"));
        assert_eq!(languages(header, &["en-US", "fr"]), Some("en-US"));
        assert_eq!(languages(header, &["pt"]), Some("pt"));
        assert_eq!(languages(header, &["fr"]), None);
        assert_eq!(preferred_values(header, "*"), ["es", "pt-BR", "en"]);
    }

    #[test]
    fn type_matching() {
        let json = "application/json; charset=utf-8";
        assert_eq!(type_is(json, &["json"]).unwrap().as_deref(), Some("json"));
        assert_eq!(type_is(json, &["application/*"]).unwrap().as_deref(), Some("application/json"));
        assert_eq!(type_is("application/ld+json", &["+json"]).unwrap().as_deref(), Some("application/ld+json"));
        assert_eq!(type_is("application/x-www-form-urlencoded", &["urlencoded"]).unwrap().as_deref(), Some("urlencoded"));
        assert_eq!(type_is("multipart/form-data; boundary=x", &["multipart"]).unwrap().as_deref(), Some("multipart"));
        assert_eq!(type_is(json, &["html", "text/*"]).unwrap(), None);
        assert_eq!(type_is("not a type", &["json"]).unwrap(), None);
    }
}
