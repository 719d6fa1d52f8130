/*
 * uri.rs
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

//! URL helpers: connection targets, request-target, Host header, canonical root.
//!
//! A `Target` is the (scheme, host, port) triple a connection is bound to. The same
//! triple is the protection space for authentication.

use std::fmt;

use url::Url;

use crate::error::HttpError;

/// URL scheme supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Https)
    }
}

/// Connection target: scheme, lower-cased host, explicit port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Target for an absolute http(s) URL.
    pub fn from_url(url: &Url) -> Result<Self, HttpError> {
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(HttpError::InvalidUrl(format!("unsupported scheme: {}", other)));
            }
        };
        let host = match url.host() {
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            Some(h) => h.to_string(),
            None => return Err(HttpError::InvalidUrl(format!("no host in {}", url))),
        };
        let port = url.port().unwrap_or(scheme.default_port());
        Ok(Self::new(scheme, host, port))
    }

    /// `host:port` suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.socket_addr())
    }
}

/// Parse an absolute http or https URL.
pub fn parse_http_url(s: &str) -> Result<Url, HttpError> {
    let url = Url::parse(s).map_err(|e| HttpError::InvalidUrl(format!("{}: {}", s, e)))?;
    if !url.username().is_empty() || url.password().is_some() {
        return Err(HttpError::InvalidUrl(format!(
            "userinfo in request URL not supported: {}",
            s
        )));
    }
    Target::from_url(&url)?;
    Ok(url)
}

/// Resolve a Location header value against the URL of the request it answered.
/// Relative references are tolerated.
pub fn resolve_location(base: &Url, location: &str) -> Result<Url, HttpError> {
    let url = base
        .join(location.trim())
        .map_err(|e| HttpError::InvalidUrl(format!("bad Location {}: {}", location, e)))?;
    Target::from_url(&url)?;
    Ok(url)
}

/// Request-target for the request line: path plus query, never the fragment.
pub fn request_target(url: &Url) -> String {
    let path = url.path();
    let path = if path.is_empty() { "/" } else { path };
    match url.query() {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    }
}

/// Host header value: host, plus port when it is not the scheme default.
pub fn host_header(target: &Target) -> String {
    let host = if target.host.contains(':') {
        format!("[{}]", target.host)
    } else {
        target.host.clone()
    };
    if target.port == target.scheme.default_port() {
        host
    } else {
        format!("{}:{}", host, target.port)
    }
}

/// True if two URLs share scheme, host and port.
pub fn same_root(a: &Url, b: &Url) -> bool {
    match (Target::from_url(a), Target::from_url(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}
