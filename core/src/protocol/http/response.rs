/*
 * response.rs
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

//! HTTP response: status, headers and a body streamed from the owning connection.

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use url::Url;

use crate::error::HttpError;
use crate::protocol::http::connection::HttpVersion;
use crate::protocol::http::headers::Headers;
use crate::protocol::http::request::Method;

/// Item sent from a connection's reader task to the response body.
#[derive(Debug)]
pub(crate) enum BodyFrame {
    Data(Bytes),
    Trailers(Headers),
}

/// Response body. Data arrives from the connection as it is read; dropping the
/// body lets the connection discard the rest without affecting later responses.
#[derive(Debug)]
pub struct ResponseBody {
    rx: Option<mpsc::Receiver<Result<BodyFrame, HttpError>>>,
    trailers: Headers,
}

impl ResponseBody {
    pub fn empty() -> Self {
        Self {
            rx: None,
            trailers: Headers::new(),
        }
    }

    pub(crate) fn streaming(rx: mpsc::Receiver<Result<BodyFrame, HttpError>>) -> Self {
        Self {
            rx: Some(rx),
            trailers: Headers::new(),
        }
    }

    /// Next chunk of body data, or `None` at the end of the body.
    pub async fn chunk(&mut self) -> Option<Result<Bytes, HttpError>> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Some(Ok(BodyFrame::Data(data))) => return Some(Ok(data)),
                Some(Ok(BodyFrame::Trailers(t))) => self.trailers = t,
                Some(Err(e)) => {
                    self.rx = None;
                    return Some(Err(e));
                }
                None => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Read the rest of the body into one buffer.
    pub async fn bytes(&mut self) -> Result<Bytes, HttpError> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }

    /// Read the rest of the body and drop it.
    pub async fn discard(&mut self) -> Result<(), HttpError> {
        while let Some(chunk) = self.chunk().await {
            chunk?;
        }
        Ok(())
    }

    /// Trailer fields of a chunked body; empty until the body has been read to the end.
    pub fn trailers(&self) -> &Headers {
        &self.trailers
    }
}

/// An HTTP response.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub version: HttpVersion,
    pub headers: Headers,
    pub body: ResponseBody,
    /// URL of the request this response answers (after redirects).
    pub url: Url,
    /// Method of the request this response answers.
    pub method: Method,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }

    pub fn location(&self) -> Option<&str> {
        self.headers.get("Location")
    }

    pub fn set_cookie_headers(&self) -> Vec<&str> {
        self.headers.get_all("Set-Cookie").collect()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("Content-Length").and_then(|v| v.trim().parse().ok())
    }

    /// Read the whole body.
    pub async fn bytes(mut self) -> Result<Bytes, HttpError> {
        self.body.bytes().await
    }

    /// Read the whole body as UTF-8 (lossy).
    pub async fn text(mut self) -> Result<String, HttpError> {
        let data = self.body.bytes().await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }
}
