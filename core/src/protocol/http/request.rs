/*
 * request.rs
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

//! HTTP request: method, target URL, headers, optional body.
//!
//! Submitted through `HttpClient::submit`; the connection serializes it with
//! `h1::writer`.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncRead;
use url::Url;

use crate::error::HttpError;
use crate::protocol::http::headers::Headers;
use crate::uri::{parse_http_url, Target};

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Trace,
    Other(&'static str),
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Trace => "TRACE",
            Method::Other(s) => s,
        }
    }

    /// Idempotent per RFC 2616 9.1.2: repeating the request has no additional effect.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Method::Get | Method::Head | Method::Put | Method::Delete | Method::Options | Method::Trace
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reader producing a streamed request body.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// Opens a fresh body reader. Called once per transmission attempt, so a
/// streamed body can be sent again after a retry or redirect.
pub type BodyFactory = Arc<dyn Fn() -> BodyReader + Send + Sync>;

/// Request body.
#[derive(Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    /// Known length, sent with Content-Length.
    Bytes(Bytes),
    /// Unknown length, sent chunked unless the caller set Content-Length.
    Stream(BodyFactory),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    pub fn stream<F, R>(open: F) -> Self
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Body::Stream(Arc::new(move || Box::new(open()) as BodyReader))
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Body::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(v))
    }
}

impl From<&'static [u8]> for Body {
    fn from(v: &'static [u8]) -> Self {
        Body::Bytes(Bytes::from_static(v))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Bytes(Bytes::from(s))
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Bytes(b)
    }
}

/// An HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: Headers,
    pub body: Body,
    /// Follow 3xx responses automatically.
    pub follow_redirects: bool,
    /// Overrides `ClientConfig::max_retries` for this request.
    pub max_retries: Option<u32>,
}

impl Request {
    pub fn new(method: Method, url: &str) -> Result<Self, HttpError> {
        Ok(Self::with_url(method, parse_http_url(url)?))
    }

    pub fn with_url(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Headers::new(),
            body: Body::Empty,
            follow_redirects: true,
            max_retries: None,
        }
    }

    pub fn get(url: &str) -> Result<Self, HttpError> {
        Self::new(Method::Get, url)
    }

    pub fn post(url: &str) -> Result<Self, HttpError> {
        Self::new(Method::Post, url)
    }

    /// Add a header, keeping earlier values with the same name.
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.append(name, value);
        self
    }

    /// Set the request body.
    pub fn body(&mut self, body: impl Into<Body>) -> &mut Self {
        self.body = body.into();
        self
    }

    pub fn is_idempotent(&self) -> bool {
        self.method.is_idempotent()
    }

    pub fn target(&self) -> Result<Target, HttpError> {
        Target::from_url(&self.url)
    }

    /// True if the request can share a connection with earlier unanswered requests.
    pub fn is_pipelinable(&self) -> bool {
        self.is_idempotent() && self.body.is_empty()
    }
}
