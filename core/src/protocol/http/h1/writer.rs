/*
 * writer.rs
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

//! HTTP/1.1 request serialization: request line, headers, body framing.

use bytes::{BufMut, BytesMut};

use crate::error::HttpError;
use crate::protocol::http::grammar::is_token;
use crate::protocol::http::headers::Headers;
use crate::protocol::http::request::{Body, Method, Request};
use crate::uri::{host_header, request_target, Target};

/// How the body following the head is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    None,
    Length(u64),
    Chunked,
}

fn valid_value(value: &str) -> bool {
    !value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0)
}

/// Serialize the request head. Host is added unless supplied; framing headers
/// are derived from the body.
pub fn encode_head(request: &Request, target: &Target) -> Result<(BytesMut, Framing), HttpError> {
    let mut out = BytesMut::with_capacity(256);
    out.put_slice(request.method.as_str().as_bytes());
    out.put_u8(b' ');
    out.put_slice(request_target(&request.url).as_bytes());
    out.put_slice(b" HTTP/1.1\r\n");

    if !request.headers.contains("Host") {
        put_header(&mut out, "Host", &host_header(target));
    }

    let caller_length = request
        .headers
        .get("Content-Length")
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| HttpError::syntax(format!("invalid Content-Length: {:?}", v)))
        })
        .transpose()?;

    let framing = match &request.body {
        Body::Empty => Framing::None,
        Body::Bytes(b) => Framing::Length(b.len() as u64),
        Body::Stream(_) => match caller_length {
            Some(n) => Framing::Length(n),
            None => Framing::Chunked,
        },
    };

    for (name, value) in request.headers.iter() {
        if !is_token(name) || !valid_value(value) {
            return Err(HttpError::syntax(format!("invalid request header: {:?}", name)));
        }
        let framing_header = name.eq_ignore_ascii_case("Content-Length")
            || name.eq_ignore_ascii_case("Transfer-Encoding");
        if framing_header && framing != Framing::None {
            continue;
        }
        put_header(&mut out, name, value);
    }

    match framing {
        Framing::None => {
            let needs_zero = matches!(request.method, Method::Post | Method::Put);
            if needs_zero && caller_length.is_none() {
                put_header(&mut out, "Content-Length", "0");
            }
        }
        Framing::Length(n) => put_header(&mut out, "Content-Length", &n.to_string()),
        Framing::Chunked => put_header(&mut out, "Transfer-Encoding", "chunked"),
    }
    out.put_slice(b"\r\n");
    Ok((out, framing))
}

fn put_header(out: &mut BytesMut, name: &str, value: &str) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value.as_bytes());
    out.put_slice(b"\r\n");
}

/// Append one chunk. Empty data writes nothing (a zero-size chunk would end the body).
pub fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

/// Append the terminating zero-size chunk and any trailers.
pub fn encode_last_chunk(trailers: &Headers, out: &mut BytesMut) {
    out.put_slice(b"0\r\n");
    for (name, value) in trailers.iter() {
        put_header(out, name, value);
    }
    out.put_slice(b"\r\n");
}
