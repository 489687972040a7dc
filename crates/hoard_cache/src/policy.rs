//! Cacheability rules for requests and responses.

use std::time::Duration;

use hoard_config::CacheConfig;
use http::{HeaderMap, Method, StatusCode, header::CACHE_CONTROL};

/// Upper bound applied to any TTL, `max-age` or configured (2^31 seconds).
pub const MAX_TTL_SECS: u64 = 2_147_483_648;

/// Why an exchange was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Method,
    Path,
    /// `Cache-Control` carried `private` or `no-store`.
    Directive(&'static str),
    /// `max-age` without a positive integer value.
    MalformedDirective,
    /// Zero default TTL and no `max-age`.
    NoLifetime,
    ServerError(StatusCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    Store(Duration),
    Skip(SkipReason),
}

pub struct CachePolicy;

impl CachePolicy {
    /// `GET` under one of the configured path prefixes.
    pub fn is_cacheable_request(method: &Method, path: &str, cfg: &CacheConfig) -> bool {
        Self::check_request(method, path, cfg).is_ok()
    }

    pub fn check_request(method: &Method, path: &str, cfg: &CacheConfig) -> Result<(), SkipReason> {
        if *method != Method::GET {
            return Err(SkipReason::Method);
        }
        if !cfg
            .cacheable_paths()
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return Err(SkipReason::Path);
        }
        Ok(())
    }

    /// False when `Cache-Control` contains `private` or `no-store`.
    pub fn is_cacheable_response(headers: &HeaderMap) -> bool {
        blocking_directive(&parse_cache_control(headers)).is_none()
    }

    /// TTL from `max-age` when present, else the configured default.
    /// `None` means the lifetime is not usable and the response must not be stored.
    pub fn effective_expiration(headers: &HeaderMap, cfg: &CacheConfig) -> Option<Duration> {
        lifetime(&parse_cache_control(headers), cfg).ok()
    }

    /// Full response-side decision for an exchange whose request already passed.
    pub fn evaluate_response(
        status: StatusCode,
        headers: &HeaderMap,
        cfg: &CacheConfig,
    ) -> CacheDecision {
        if status.is_server_error() {
            return CacheDecision::Skip(SkipReason::ServerError(status));
        }

        let directives = parse_cache_control(headers);
        if let Some(name) = blocking_directive(&directives) {
            return CacheDecision::Skip(SkipReason::Directive(name));
        }

        match lifetime(&directives, cfg) {
            Ok(ttl) => CacheDecision::Store(ttl),
            Err(reason) => CacheDecision::Skip(reason),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Directive {
    name: String,
    value: Option<String>,
}

/// Combine every `Cache-Control` field in order and split it into directives.
/// Non-ASCII bytes (obs-text in quoted extension values) are read lossily.
fn parse_cache_control(headers: &HeaderMap) -> Vec<Directive> {
    let mut directives = Vec::new();
    for value in headers.get_all(CACHE_CONTROL) {
        let value = String::from_utf8_lossy(value.as_bytes());
        for token in value.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (name, value) = match token.split_once('=') {
                Some((name, value)) => (name.trim(), Some(unquote(value.trim()).to_string())),
                None => (token, None),
            };
            directives.push(Directive {
                name: name.to_ascii_lowercase(),
                value,
            });
        }
    }
    directives
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn blocking_directive(directives: &[Directive]) -> Option<&'static str> {
    directives.iter().find_map(|d| match d.name.as_str() {
        "private" => Some("private"),
        "no-store" => Some("no-store"),
        _ => None,
    })
}

fn lifetime(directives: &[Directive], cfg: &CacheConfig) -> Result<Duration, SkipReason> {
    let secs = match directives.iter().find(|d| d.name == "max-age") {
        Some(directive) => {
            let secs = directive
                .value
                .as_deref()
                .and_then(|v| v.parse::<i64>().ok())
                .ok_or(SkipReason::MalformedDirective)?;
            if secs <= 0 {
                return Err(SkipReason::MalformedDirective);
            }
            secs as u64
        }
        None => match cfg.default_max_age_secs() {
            0 => return Err(SkipReason::NoLifetime),
            secs => secs,
        },
    };
    Ok(Duration::from_secs(secs.min(MAX_TTL_SECS)))
}
