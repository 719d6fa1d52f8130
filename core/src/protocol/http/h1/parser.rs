/*
 * parser.rs
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

//! HTTP/1.x response push parser: status line, headers, body (Content-Length,
//! chunked, or read-until-close).
//!
//! Malformed input is reported as `HttpError::Syntax`, which the connection
//! treats as fatal.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::HttpError;
use crate::protocol::http::connection::HttpVersion;
use crate::protocol::http::grammar::is_token;

/// Largest accepted status line plus header block.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Callback for response events. The connection implements this and turns the
/// events into a `Response` and its body stream.
pub trait H1ResponseHandler {
    fn status(&mut self, version: HttpVersion, code: u16, reason: &str);
    fn header(&mut self, name: &str, value: &str);
    fn body_chunk(&mut self, data: Bytes);
    fn trailer(&mut self, name: &str, value: &str);
    fn complete(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    StatusLine,
    Headers,
    /// Headers done; the connection must call `set_body_mode()`.
    HeadersComplete,
    Body,
    UntilClose,
    ChunkSize,
    ChunkData,
    /// CRLF after chunk data.
    ChunkDataEnd,
    ChunkTrailer,
    /// Response fully parsed.
    Complete,
}

/// How the body of the current response is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Push parser for one response at a time. Feed bytes via `receive`; call
/// `reset` before the next response on the same connection.
pub struct ResponseParser {
    state: ParseState,
    remaining: u64,
    head_bytes: usize,
    /// Header line held back until we know no continuation line follows.
    pending: Option<(String, String)>,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::StatusLine,
            remaining: 0,
            head_bytes: 0,
            pending: None,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = ParseState::StatusLine;
        self.remaining = 0;
        self.head_bytes = 0;
        self.pending = None;
    }

    fn find_crlf(buf: &[u8]) -> Option<usize> {
        buf.windows(2).position(|w| w == b"\r\n")
    }

    /// Take one CRLF-terminated line (without the CRLF) from the head section,
    /// enforcing the head size limit.
    fn take_head_line(&mut self, buf: &mut BytesMut) -> Result<Option<String>, HttpError> {
        let line_end = match Self::find_crlf(buf) {
            Some(n) => n,
            None => {
                if self.head_bytes + buf.len() > MAX_HEAD_SIZE {
                    return Err(HttpError::syntax("response head too large"));
                }
                return Ok(None);
            }
        };
        self.head_bytes += line_end + 2;
        if self.head_bytes > MAX_HEAD_SIZE {
            return Err(HttpError::syntax("response head too large"));
        }
        let line = buf.split_to(line_end + 2);
        decode_line(&line[..line_end]).map(Some)
    }

    /// Consume and parse as much as possible from buf. Partial lines stay in buf.
    pub fn receive<H: H1ResponseHandler>(
        &mut self,
        buf: &mut BytesMut,
        handler: &mut H,
    ) -> Result<(), HttpError> {
        while !buf.is_empty() {
            match self.state {
                ParseState::StatusLine => {
                    let line = match self.take_head_line(buf)? {
                        Some(l) => l,
                        None => return Ok(()),
                    };
                    // Leading empty lines are ignored (RFC 2616 4.1).
                    if line.is_empty() {
                        continue;
                    }
                    let (version, code, reason) = parse_status_line(&line)?;
                    handler.status(version, code, reason);
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let line = match self.take_head_line(buf)? {
                        Some(l) => l,
                        None => return Ok(()),
                    };
                    if line.is_empty() {
                        self.flush_pending(handler, false);
                        self.state = ParseState::HeadersComplete;
                        return Ok(());
                    }
                    self.header_line(&line, handler, false)?;
                }
                ParseState::HeadersComplete => return Ok(()),
                ParseState::Body => {
                    let to_read = self.remaining.min(buf.len() as u64) as usize;
                    if to_read > 0 {
                        handler.body_chunk(buf.split_to(to_read).freeze());
                        self.remaining -= to_read as u64;
                    }
                    if self.remaining == 0 {
                        handler.complete();
                        self.state = ParseState::Complete;
                    }
                }
                ParseState::UntilClose => {
                    handler.body_chunk(buf.split().freeze());
                    return Ok(());
                }
                ParseState::ChunkSize => {
                    let line_end = match Self::find_crlf(buf) {
                        Some(n) => n,
                        None => {
                            if buf.len() > 1024 {
                                return Err(HttpError::syntax("chunk size line too long"));
                            }
                            return Ok(());
                        }
                    };
                    let line = buf.split_to(line_end + 2);
                    self.remaining = parse_chunk_size(&line[..line_end])?;
                    self.state = if self.remaining == 0 {
                        ParseState::ChunkTrailer
                    } else {
                        ParseState::ChunkData
                    };
                }
                ParseState::ChunkData => {
                    let to_read = self.remaining.min(buf.len() as u64) as usize;
                    handler.body_chunk(buf.split_to(to_read).freeze());
                    self.remaining -= to_read as u64;
                    if self.remaining == 0 {
                        self.state = ParseState::ChunkDataEnd;
                    }
                }
                ParseState::ChunkDataEnd => {
                    if buf.len() < 2 {
                        if buf[0] != b'\r' {
                            return Err(HttpError::syntax("missing CRLF after chunk data"));
                        }
                        return Ok(());
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(HttpError::syntax("missing CRLF after chunk data"));
                    }
                    buf.advance(2);
                    self.state = ParseState::ChunkSize;
                }
                ParseState::ChunkTrailer => {
                    let line = match self.take_head_line(buf)? {
                        Some(l) => l,
                        None => return Ok(()),
                    };
                    if line.is_empty() {
                        self.flush_pending(handler, true);
                        handler.complete();
                        self.state = ParseState::Complete;
                    } else {
                        self.header_line(&line, handler, true)?;
                    }
                }
                ParseState::Complete => return Ok(()),
            }
        }
        Ok(())
    }

    fn header_line<H: H1ResponseHandler>(
        &mut self,
        line: &str,
        handler: &mut H,
        trailer: bool,
    ) -> Result<(), HttpError> {
        if line.starts_with(' ') || line.starts_with('\t') {
            // Obsolete line folding: continuation of the previous field.
            let more = line.trim_matches(|c| c == ' ' || c == '\t');
            match self.pending.as_mut() {
                Some((_, value)) => {
                    if !more.is_empty() {
                        if !value.is_empty() {
                            value.push(' ');
                        }
                        value.push_str(more);
                    }
                    return Ok(());
                }
                None => return Err(HttpError::syntax("continuation line without header")),
            }
        }
        let colon = line
            .find(':')
            .ok_or_else(|| HttpError::syntax(format!("header line without colon: {:?}", line)))?;
        let name = &line[..colon];
        if !is_token(name) {
            return Err(HttpError::syntax(format!("invalid header name: {:?}", name)));
        }
        let value = line[colon + 1..].trim_matches(|c| c == ' ' || c == '\t');
        self.flush_pending(handler, trailer);
        self.pending = Some((name.to_string(), value.to_string()));
        Ok(())
    }

    fn flush_pending<H: H1ResponseHandler>(&mut self, handler: &mut H, trailer: bool) {
        if let Some((name, value)) = self.pending.take() {
            if trailer {
                handler.trailer(&name, &value);
            } else {
                handler.header(&name, &value);
            }
        }
    }

    /// Called by the connection once the head is complete. `BodyMode::None`
    /// completes the response immediately.
    pub fn set_body_mode<H: H1ResponseHandler>(&mut self, mode: BodyMode, handler: &mut H) {
        if self.state != ParseState::HeadersComplete {
            return;
        }
        match mode {
            BodyMode::None | BodyMode::Length(0) => {
                handler.complete();
                self.state = ParseState::Complete;
            }
            BodyMode::Length(n) => {
                self.remaining = n;
                self.state = ParseState::Body;
            }
            BodyMode::Chunked => self.state = ParseState::ChunkSize,
            BodyMode::UntilClose => self.state = ParseState::UntilClose,
        }
    }

    /// The peer closed the connection. Completes a read-until-close body; any
    /// other unfinished state is a premature close.
    pub fn finish_eof<H: H1ResponseHandler>(&mut self, handler: &mut H) -> bool {
        match self.state {
            ParseState::UntilClose => {
                handler.complete();
                self.state = ParseState::Complete;
                true
            }
            ParseState::Complete => true,
            _ => false,
        }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `HTTP/x.y SP code [SP reason]`.
pub fn parse_status_line(line: &str) -> Result<(HttpVersion, u16, &str), HttpError> {
    let bad = || HttpError::syntax(format!("malformed status line: {:?}", line));
    let rest = line.strip_prefix("HTTP/").ok_or_else(bad)?;
    let (version_str, rest) = rest.split_once(' ').ok_or_else(bad)?;
    let (major, minor) = version_str.split_once('.').ok_or_else(bad)?;
    let digits = |s: &str| !s.is_empty() && s.len() <= 3 && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(major) || !digits(minor) {
        return Err(bad());
    }
    let major: u32 = major.parse().map_err(|_| bad())?;
    let minor: u32 = minor.parse().map_err(|_| bad())?;
    let version = match (major, minor) {
        (1, 0) => HttpVersion::Http1_0,
        (1, _) => HttpVersion::Http1_1,
        (m, _) if m > 1 => HttpVersion::Http1_1,
        _ => return Err(bad()),
    };
    let rest = rest.trim_start_matches(' ');
    let (code_str, reason) = match rest.split_once(' ') {
        Some((c, r)) => (c, r),
        None => (rest, ""),
    };
    if code_str.len() != 3 || !code_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let code: u16 = code_str.parse().map_err(|_| bad())?;
    if code < 100 {
        return Err(bad());
    }
    Ok((version, code, reason))
}

/// Decode a head line as ISO-8859-1. Control characters other than HTAB are rejected.
fn decode_line(line: &[u8]) -> Result<String, HttpError> {
    if line.iter().any(|&b| (b < 0x20 && b != b'\t') || b == 0x7f) {
        return Err(HttpError::syntax("control character in response head"));
    }
    Ok(line.iter().map(|&b| char::from(b)).collect())
}

/// Parse a chunk-size line (hex size, optional `;extension`).
fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpError> {
    let text = decode_line(line)?;
    let text = text.as_str();
    let hex = text.split(';').next().unwrap_or("").trim_matches(|c| c == ' ' || c == '\t');
    if hex.is_empty() || hex.len() > 16 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(HttpError::syntax(format!("invalid chunk size: {:?}", text)));
    }
    u64::from_str_radix(hex, 16).map_err(|_| HttpError::syntax(format!("invalid chunk size: {:?}", text)))
}
