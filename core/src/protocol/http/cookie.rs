/*
 * cookie.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Corriere, an HTTP/1.x client engine.
 *
 * Corriere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Corriere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Corriere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Cookies (RFC 6265): Set-Cookie parsing, domain/path scoping, in-memory jar.

use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use url::Url;

use crate::protocol::http::headers::Headers;

/// A stored cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Lower-case domain without a leading dot.
    pub domain: String,
    /// Sent only to exactly `domain` (no Domain attribute, or one naming the host itself).
    pub host_only: bool,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    /// `None` for a session cookie.
    pub expires: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

impl Cookie {
    pub fn is_persistent(&self) -> bool {
        self.expires.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires, Some(t) if t <= now)
    }

    /// True if this cookie should be sent with a request to `url`.
    pub fn matches(&self, url: &Url) -> bool {
        let host = match url.host_str() {
            Some(h) => h.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase(),
            None => return false,
        };
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_match(&host, &self.domain)
        };
        domain_ok && path_match(url.path(), &self.path) && (!self.secure || url.scheme() == "https")
    }

    /// Parse a Set-Cookie value received from `url`. Returns `None` if the
    /// header is malformed or the cookie may not be set by that host.
    pub fn parse(header: &str, url: &Url, now: DateTime<Utc>) -> Option<Cookie> {
        let host = url
            .host_str()?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let value = value.trim().trim_matches('"');

        let mut domain: Option<String> = None;
        let mut path: Option<String> = None;
        let mut secure = false;
        let mut http_only = false;
        let mut expires: Option<DateTime<Utc>> = None;
        let mut max_age: Option<DateTime<Utc>> = None;
        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" => {
                    let d = val.trim_start_matches('.').to_ascii_lowercase();
                    if !d.is_empty() {
                        domain = Some(d);
                    }
                }
                "path" => {
                    if val.starts_with('/') {
                        path = Some(val.to_string());
                    }
                }
                "secure" => secure = true,
                "httponly" => http_only = true,
                "expires" => {
                    if let Some(t) = parse_cookie_date(val) {
                        expires = Some(t);
                    }
                }
                "max-age" => {
                    let digits = val.strip_prefix('-').unwrap_or(val);
                    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                        let overflow = if val.starts_with('-') { 0 } else { i64::MAX };
                        let secs: i64 = val.parse().unwrap_or(overflow);
                        max_age = Some(if secs <= 0 {
                            DateTime::<Utc>::MIN_UTC
                        } else {
                            now.checked_add_signed(Duration::seconds(secs.min(i64::MAX / 1000)))
                                .unwrap_or(DateTime::<Utc>::MAX_UTC)
                        });
                    }
                }
                _ => {}
            }
        }

        let (domain, host_only) = match domain {
            Some(d) if d == host => (d, true),
            Some(d) => {
                if !domain_match(&host, &d) {
                    return None;
                }
                (d, false)
            }
            None => (host.clone(), true),
        };
        Some(Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain,
            host_only,
            path: path.unwrap_or_else(|| default_path(url.path())),
            secure,
            http_only,
            expires: max_age.or(expires),
            created: now,
        })
    }
}

/// RFC 6265 5.1.3. IP addresses only match themselves.
pub fn domain_match(host: &str, domain: &str) -> bool {
    if host == domain {
        return true;
    }
    if host.parse::<IpAddr>().is_ok() {
        return false;
    }
    host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

/// RFC 6265 5.1.4.
pub fn path_match(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

/// Default cookie path: the request path up to, not including, its last '/'.
fn default_path(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

/// Parse an Expires attribute in the common formats.
fn parse_cookie_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc2822(s) {
        return Some(t.with_timezone(&Utc));
    }
    let s = s.trim_end_matches(" GMT").trim_end_matches(" UTC");
    for fmt in ["%a, %d-%b-%Y %H:%M:%S", "%A, %d-%b-%y %H:%M:%S", "%a, %d %b %Y %H:%M:%S", "%a %b %e %H:%M:%S %Y"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(t.and_utc());
        }
    }
    None
}

/// `Cookie` request header value for `cookies`, in the given order.
pub fn cookie_header(cookies: &[Cookie]) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }
    let pairs: Vec<String> = cookies.iter().map(|c| format!("{}={}", c.name, c.value)).collect();
    Some(pairs.join("; "))
}

/// Cookie persistence used by the request manager.
pub trait CookieStore: Send + Sync {
    /// Cookies to send to `url`, longest path first, then oldest first.
    fn cookies_for(&self, url: &Url) -> Vec<Cookie>;

    /// Store the `Set-Cookie` headers of a response from `url`.
    fn record(&self, url: &Url, headers: &Headers);
}

/// Which domains may receive domain cookies.
///
/// A domain under a private suffix is never public. Otherwise it is public
/// if it matches a public rule or has no more than `depth` labels. Public
/// rules are exact domains or `*.suffix`, meaning any single label under suffix.
#[derive(Debug, Clone)]
struct SuffixPolicy {
    depth: usize,
    public: Vec<String>,
    private: Vec<String>,
}

impl Default for SuffixPolicy {
    fn default() -> Self {
        Self {
            depth: usize::MAX,
            public: Vec::new(),
            private: Vec::new(),
        }
    }
}

impl SuffixPolicy {
    fn is_public(&self, domain: &str) -> bool {
        if self.private.iter().any(|s| domain_match(domain, s)) {
            return false;
        }
        if self.public.iter().any(|rule| rule_match(domain, rule)) {
            return true;
        }
        domain.split('.').count() <= self.depth
    }
}

fn rule_match(domain: &str, rule: &str) -> bool {
    match rule.strip_prefix("*.") {
        Some(parent) => domain
            .strip_suffix(parent)
            .and_then(|head| head.strip_suffix('.'))
            .is_some_and(|label| !label.is_empty() && !label.contains('.')),
        None => domain == rule,
    }
}

fn normalize_suffix(suffix: &str) -> String {
    suffix.trim_start_matches('.').to_ascii_lowercase()
}

/// In-memory cookie jar.
///
/// Domain cookies are refused unless their domain has been allowed with
/// [`CookieJar::add_private_suffix`] or the public depth lowered with
/// [`CookieJar::set_public_depth`]. A Domain attribute naming the host
/// itself is always accepted as a host-only cookie.
#[derive(Default)]
pub struct CookieJar {
    cookies: Mutex<Vec<Cookie>>,
    policy: Mutex<SuffixPolicy>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn cookies(&self) -> MutexGuard<'_, Vec<Cookie>> {
        self.cookies.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn policy(&self) -> MutexGuard<'_, SuffixPolicy> {
        self.policy.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Allow domain cookies for `suffix` and every domain below it, e.g. `example.com`.
    pub fn add_private_suffix(&self, suffix: &str) {
        self.policy().private.push(normalize_suffix(suffix));
    }

    /// Refuse domain cookies for `suffix`, e.g. `co.uk` or `*.tokyo.jp`.
    pub fn add_public_suffix(&self, suffix: &str) {
        self.policy().public.push(normalize_suffix(suffix));
    }

    /// Treat every domain of at most `depth` labels as public. With the
    /// default of `usize::MAX` no domain cookie is accepted; 1 refuses only
    /// top-level domains.
    pub fn set_public_depth(&self, depth: usize) {
        self.policy().depth = depth;
    }

    /// True if a Domain attribute of `domain` would be refused.
    pub fn is_public_domain(&self, domain: &str) -> bool {
        self.policy().is_public(&normalize_suffix(domain))
    }

    /// Store one parsed cookie. A cookie with the same name, domain and path is
    /// replaced and its creation time kept; an already expired cookie deletes it.
    pub fn insert(&self, mut cookie: Cookie, now: DateTime<Utc>) {
        let mut cookies = self.cookies();
        if let Some(i) = cookies.iter().position(|c| {
            c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path
        }) {
            cookie.created = cookies[i].created;
            cookies.remove(i);
        }
        if !cookie.is_expired(now) {
            cookies.push(cookie);
        }
    }

    pub fn len(&self) -> usize {
        self.cookies().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop cookies that have expired by `now`.
    pub fn expire(&self, now: DateTime<Utc>) {
        self.cookies().retain(|c| !c.is_expired(now));
    }

    /// Drop session cookies as well as expired ones.
    pub fn end_session(&self, now: DateTime<Utc>) {
        self.cookies().retain(|c| c.is_persistent() && !c.is_expired(now));
    }
}

impl CookieStore for CookieJar {
    fn cookies_for(&self, url: &Url) -> Vec<Cookie> {
        let now = Utc::now();
        let mut cookies = self.cookies();
        cookies.retain(|c| !c.is_expired(now));
        let mut matched: Vec<Cookie> = cookies.iter().filter(|c| c.matches(url)).cloned().collect();
        matched.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then(a.created.cmp(&b.created)));
        matched
    }

    fn record(&self, url: &Url, headers: &Headers) {
        let now = Utc::now();
        for value in headers.get_all("Set-Cookie") {
            match Cookie::parse(value, url, now) {
                Some(cookie) if !cookie.host_only && self.is_public_domain(&cookie.domain) => {
                    tracing::debug!(url = %url, domain = %cookie.domain, "ignoring cookie for public domain")
                }
                Some(cookie) => self.insert(cookie, now),
                None => tracing::debug!(url = %url, header = value, "ignoring Set-Cookie"),
            }
        }
    }
}
