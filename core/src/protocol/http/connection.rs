/*
 * connection.rs
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

//! HTTP connection: one TCP or TLS stream bound to one target, carrying a FIFO
//! pipeline of requests.
//!
//! Two tasks run per connection. The writer takes exchanges from an unbounded
//! channel, waits until the pipeline allows another request, and writes it. The
//! reader drives the H1 parser and answers the oldest in-flight request, then
//! streams its body. A transport or protocol failure closes the connection and
//! fails every request still queued on it with the progress each had made.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_rustls::client::TlsStream as TokioTlsStream;
use tracing::{debug, error, warn};
use url::Url;

use crate::error::{ConnectionErrorKind, HttpError, Progress};
use crate::protocol::http::grammar::split_list;
use crate::protocol::http::h1::{
    encode_chunk, encode_head, encode_last_chunk, BodyMode, Framing, H1ResponseHandler, ParseState,
    ResponseParser,
};
use crate::protocol::http::headers::Headers;
use crate::protocol::http::request::{Body, Method, Request};
use crate::protocol::http::response::{BodyFrame, Response, ResponseBody};
use crate::uri::Target;

const READ_BUFFER_SIZE: usize = 8192;
const BODY_CHANNEL_CAPACITY: usize = 8;
const UPLOAD_CHUNK_SIZE: usize = 16 * 1024;

/// Protocol version spoken by the peer, learned from its first status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http1_0,
    Http1_1,
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpVersion::Http1_0 => f.write_str("HTTP/1.0"),
            HttpVersion::Http1_1 => f.write_str("HTTP/1.1"),
        }
    }
}

/// Unified stream: plain TCP or TLS. Implements AsyncRead + AsyncWrite.
pub enum HttpStream {
    Plain(TcpStream),
    Tls(Box<TokioTlsStream<TcpStream>>),
}

impl AsyncRead for HttpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HttpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_flush(cx),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Connection state as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing outstanding.
    Idle,
    /// Writing a request.
    Sending,
    /// Request written, waiting for the response.
    Awaiting,
    /// Reading a response.
    Receiving,
    /// Parked on the transport with an unanswered request.
    Blocked,
    Closed,
}

/// Per-connection limits, taken from `ClientConfig`.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub pipeline_depth: usize,
    pub response_timeout: Option<Duration>,
    /// How long a reused connection may stay silent after a request is flushed.
    pub blocked_grace: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            pipeline_depth: 4,
            response_timeout: Some(Duration::from_secs(60)),
            blocked_grace: Some(Duration::from_secs(2)),
        }
    }
}

#[derive(Debug, Default)]
struct ProgressCell(AtomicU8);

impl ProgressCell {
    fn get(&self) -> Progress {
        match self.0.load(Ordering::Acquire) {
            0 => Progress::Unsent,
            1 => Progress::HeadWritten,
            _ => Progress::BodyStarted,
        }
    }

    fn advance(&self, p: Progress) {
        let v = match p {
            Progress::Unsent => 0,
            Progress::HeadWritten => 1,
            Progress::BodyStarted => 2,
        };
        self.0.fetch_max(v, Ordering::AcqRel);
    }
}

type Responder = oneshot::Sender<Result<Response, HttpError>>;

/// A request handed to the writer task.
struct Exchange {
    request: Request,
    responder: Responder,
    progress: Arc<ProgressCell>,
}

/// A request written (or being written) and not yet fully answered.
struct Pending {
    method: Method,
    url: Url,
    /// Taken when the response head is delivered.
    responder: Option<Responder>,
    progress: Arc<ProgressCell>,
    /// Another exchange preceded this one on the connection.
    reused: bool,
    flushed_at: Option<Instant>,
}

struct Shared {
    state: ConnectionState,
    version: Option<HttpVersion>,
    persistent: bool,
    /// Claimed slots: queued for the writer plus in flight.
    outstanding: usize,
    in_flight: VecDeque<Pending>,
    completed: u64,
    last_active: Instant,
    closed: bool,
}

struct ConnectionInner {
    id: u64,
    target: Target,
    settings: ConnectionSettings,
    shared: Mutex<Shared>,
    wake_reader: Notify,
    wake_writer: Notify,
    /// Shared with the pool; signalled whenever a slot frees or the connection closes.
    released: Arc<Notify>,
    exchange_tx: mpsc::UnboundedSender<Exchange>,
    closed_tx: watch::Sender<bool>,
}

/// Handle to a running connection. Cheaply cloneable.
#[derive(Clone)]
pub struct HttpConnection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("id", &self.inner.id)
            .field("target", &self.inner.target)
            .field("state", &self.state())
            .finish()
    }
}

impl HttpConnection {
    /// Spawn the reader and writer tasks over an established stream.
    pub fn start(
        id: u64,
        target: Target,
        stream: HttpStream,
        settings: ConnectionSettings,
        released: Arc<Notify>,
    ) -> Self {
        let (exchange_tx, exchange_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new(ConnectionInner {
            id,
            target,
            settings,
            shared: Mutex::new(Shared {
                state: ConnectionState::Idle,
                version: None,
                persistent: true,
                outstanding: 0,
                in_flight: VecDeque::new(),
                completed: 0,
                last_active: Instant::now(),
                closed: false,
            }),
            wake_reader: Notify::new(),
            wake_writer: Notify::new(),
            released,
            exchange_tx,
            closed_tx,
        });
        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(write_loop(inner.clone(), writer, exchange_rx));
        tokio::spawn(read_loop(inner.clone(), reader));
        debug!(conn = id, target = %inner.target, "connection started");
        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// `None` until the first status line has been read.
    pub fn version(&self) -> Option<HttpVersion> {
        self.inner.lock().version
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.lock().persistent
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Requests claimed on this connection and not yet answered.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }

    pub fn is_idle(&self) -> bool {
        let shared = self.inner.lock();
        !shared.closed && shared.outstanding == 0
    }

    pub fn last_active(&self) -> Instant {
        self.inner.lock().last_active
    }

    /// Time since the connection last became idle; zero while busy.
    pub fn idle_for(&self) -> Duration {
        let shared = self.inner.lock();
        if shared.outstanding == 0 {
            shared.last_active.elapsed()
        } else {
            Duration::ZERO
        }
    }

    /// True if another idempotent request may be pipelined behind the current ones.
    pub fn can_pipeline(&self) -> bool {
        let shared = self.inner.lock();
        self.inner.pipeline_open(&shared) && shared.outstanding > 0
    }

    /// Reserve a slot. An idle connection accepts anything; a busy one only a
    /// pipelinable request when pipelining is known to be safe.
    pub fn try_claim(&self, pipelinable: bool) -> Option<Claimed> {
        let mut shared = self.inner.lock();
        if shared.closed {
            return None;
        }
        let ok = shared.outstanding == 0 || (pipelinable && self.inner.pipeline_open(&shared));
        if !ok {
            return None;
        }
        shared.outstanding += 1;
        Some(Claimed {
            conn: self.clone(),
            armed: true,
        })
    }

    /// Close the connection, failing anything queued on it.
    pub fn close(&self) {
        self.inner.shutdown(HttpError::connection(
            ConnectionErrorKind::Closed,
            Progress::Unsent,
            "connection closed locally",
        ));
    }
}

/// A reserved slot on a connection, returned by the pool. Dropping it unused
/// releases the slot.
pub struct Claimed {
    conn: HttpConnection,
    armed: bool,
}

impl Claimed {
    pub fn connection(&self) -> &HttpConnection {
        &self.conn
    }

    /// Queue the request and wait for the response head.
    ///
    /// Dropping the returned future before the request is written withdraws
    /// it; dropping it later closes the connection.
    pub async fn send(mut self, request: &Request) -> Result<Response, HttpError> {
        let (tx, rx) = oneshot::channel();
        self.armed = false;
        let progress = Arc::new(ProgressCell::default());
        let exchange = Exchange {
            request: request.clone(),
            responder: tx,
            progress: progress.clone(),
        };
        if self.conn.inner.exchange_tx.send(exchange).is_err() {
            self.conn.inner.finish_one();
            return Err(HttpError::connection(
                ConnectionErrorKind::Closed,
                Progress::Unsent,
                "connection closed",
            ));
        }
        let mut waiting = Waiting {
            inner: self.conn.inner.clone(),
            progress,
            rx,
            settled: false,
        };
        let result = (&mut waiting.rx).await;
        waiting.settled = true;
        match result {
            Ok(result) => result,
            Err(_) => Err(HttpError::connection(
                ConnectionErrorKind::Closed,
                Progress::Unsent,
                "connection dropped the request",
            )),
        }
    }
}

/// Wait for a response head. Dropped unsettled once any byte of the request
/// is on the wire, it closes the connection.
struct Waiting {
    inner: Arc<ConnectionInner>,
    progress: Arc<ProgressCell>,
    rx: oneshot::Receiver<Result<Response, HttpError>>,
    settled: bool,
}

impl Drop for Waiting {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // a delivered head is simply dropped; the reader discards its body
        if self.rx.try_recv().is_ok() {
            return;
        }
        let progress = self.progress.get();
        if progress > Progress::Unsent {
            self.inner.shutdown(HttpError::connection(
                ConnectionErrorKind::Cancelled,
                progress,
                "request abandoned in flight",
            ));
        }
    }
}

impl Drop for Claimed {
    fn drop(&mut self) {
        if self.armed {
            self.conn.inner.finish_one();
        }
    }
}

enum Turn {
    Go,
    Skip,
    Closed(Responder),
}

/// A read-side failure, with the body sender of a response whose head was
/// already delivered.
struct ReadFailure {
    error: HttpError,
    body: Option<mpsc::Sender<Result<BodyFrame, HttpError>>>,
}

impl ReadFailure {
    fn head(error: HttpError) -> Self {
        Self { error, body: None }
    }
}

impl From<HttpError> for ReadFailure {
    fn from(error: HttpError) -> Self {
        Self::head(error)
    }
}

impl ConnectionInner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pipeline_open(&self, shared: &Shared) -> bool {
        !shared.closed
            && shared.persistent
            && shared.version == Some(HttpVersion::Http1_1)
            && shared.outstanding < self.settings.pipeline_depth
    }

    fn may_start(&self, shared: &Shared, request: &Request) -> bool {
        shared.in_flight.is_empty()
            || (request.is_pipelinable()
                && shared.persistent
                && shared.version == Some(HttpVersion::Http1_1)
                && shared.in_flight.len() < self.settings.pipeline_depth)
    }

    /// One exchange has finished (answered, failed, or withdrawn).
    fn finish_one(&self) {
        {
            let mut shared = self.lock();
            shared.outstanding = shared.outstanding.saturating_sub(1);
            if shared.outstanding == 0 && !shared.closed {
                shared.state = ConnectionState::Idle;
                shared.last_active = Instant::now();
            }
        }
        self.released.notify_waiters();
        self.wake_writer.notify_one();
    }

    /// Close the connection and fail everything in flight.
    ///
    /// A syntax error goes to the request whose response was malformed; the
    /// others receive a connection error carrying their own progress.
    fn shutdown(&self, cause: HttpError) {
        let drained: Vec<Pending> = {
            let mut shared = self.lock();
            if shared.closed {
                return;
            }
            shared.closed = true;
            shared.persistent = false;
            shared.state = ConnectionState::Closed;
            let n = shared.in_flight.len();
            shared.outstanding = shared.outstanding.saturating_sub(n);
            shared.in_flight.drain(..).collect()
        };
        self.closed_tx.send_replace(true);
        self.wake_writer.notify_one();
        self.wake_reader.notify_one();
        self.released.notify_waiters();

        match &cause {
            HttpError::Syntax(msg) => {
                error!(conn = self.id, target = %self.target, error = %msg, "protocol error, closing connection")
            }
            HttpError::Connection { kind, .. }
                if drained.is_empty()
                    || matches!(kind, ConnectionErrorKind::Closed | ConnectionErrorKind::NotPersistent) =>
            {
                debug!(conn = self.id, target = %self.target, cause = %cause, pending = drained.len(), "connection closed")
            }
            _ => {
                warn!(conn = self.id, target = %self.target, cause = %cause, pending = drained.len(), "connection failed")
            }
        }

        for (i, pending) in drained.into_iter().enumerate() {
            let Some(tx) = pending.responder else {
                continue;
            };
            let progress = pending.progress.get();
            let err = match &cause {
                HttpError::Syntax(_) if i == 0 => cause.clone(),
                HttpError::Connection { .. } => cause.with_progress(progress),
                other => HttpError::connection(ConnectionErrorKind::Reset, progress, other.to_string()),
            };
            let _ = tx.send(Err(err));
        }
    }

    /// Wait until the pipeline admits `request`, then record it as in flight.
    async fn wait_turn(
        &self,
        request: &Request,
        responder: Responder,
        progress: &Arc<ProgressCell>,
        closed: &mut watch::Receiver<bool>,
    ) -> Turn {
        let mut responder = Some(responder);
        loop {
            let notified = self.wake_writer.notified();
            {
                let mut shared = self.lock();
                let Some(tx) = responder.take() else {
                    return Turn::Skip;
                };
                if shared.closed {
                    return Turn::Closed(tx);
                }
                if tx.is_closed() {
                    return Turn::Skip;
                }
                if self.may_start(&shared, request) {
                    let reused = shared.completed > 0 || !shared.in_flight.is_empty();
                    shared.in_flight.push_back(Pending {
                        method: request.method,
                        url: request.url.clone(),
                        responder: Some(tx),
                        progress: progress.clone(),
                        reused,
                        flushed_at: None,
                    });
                    shared.state = ConnectionState::Sending;
                    return Turn::Go;
                }
                responder = Some(tx);
            }
            tokio::select! {
                _ = notified => {}
                _ = closed_signal(closed) => {}
            }
        }
    }

    fn mark_flushed(&self, progress: &Arc<ProgressCell>) {
        {
            let mut shared = self.lock();
            if let Some(p) = shared
                .in_flight
                .iter_mut()
                .find(|p| Arc::ptr_eq(&p.progress, progress))
            {
                p.flushed_at = Some(Instant::now());
            }
            if shared.state == ConnectionState::Sending {
                shared.state = ConnectionState::Awaiting;
            }
        }
        self.wake_reader.notify_one();
    }

    /// Park until a request is in flight. Watches for peer close while idle.
    /// Returns false once the connection is closed.
    async fn wait_for_request(
        &self,
        reader: &mut ReadHalf<HttpStream>,
        buf: &mut BytesMut,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<bool, HttpError> {
        loop {
            let notified = self.wake_reader.notified();
            {
                let shared = self.lock();
                if shared.closed {
                    return Ok(false);
                }
                if !shared.in_flight.is_empty() {
                    return Ok(true);
                }
            }
            if !buf.is_empty() {
                return Err(HttpError::syntax("unexpected data on idle connection"));
            }
            tokio::select! {
                _ = notified => {}
                _ = closed_signal(closed) => return Ok(false),
                r = reader.read_buf(buf) => match r {
                    Ok(0) => {
                        return Err(HttpError::connection(
                            ConnectionErrorKind::Closed,
                            Progress::Unsent,
                            "peer closed idle connection",
                        ))
                    }
                    Ok(_) => {}
                    Err(e) => return Err(HttpError::from_io(&e, Progress::Unsent)),
                },
            }
        }
    }

    /// Read more response head bytes, enforcing the stalled-peer grace window
    /// and the response timeout.
    async fn fill_head(
        &self,
        reader: &mut ReadHalf<HttpStream>,
        buf: &mut BytesMut,
        closed: &mut watch::Receiver<bool>,
        seen: bool,
    ) -> Result<(), HttpError> {
        loop {
            let notified = self.wake_reader.notified();
            // Both timers run from the moment the request was flushed, not
            // while its body is still uploading.
            let (grace_deadline, response_deadline, awaiting_flush) = {
                let mut shared = self.lock();
                let flushed = shared.in_flight.front().map(|p| (p.flushed_at, p.reused));
                match flushed {
                    Some((Some(at), reused)) => {
                        shared.state = ConnectionState::Blocked;
                        let grace = self
                            .settings
                            .blocked_grace
                            .filter(|_| reused && !seen)
                            .map(|g| at + g);
                        let from = if seen { Instant::now() } else { at };
                        (grace, self.settings.response_timeout.map(|t| from + t), false)
                    }
                    Some((None, _)) => (None, None, true),
                    None => (None, None, false),
                }
            };
            tokio::select! {
                r = reader.read_buf(buf) => {
                    return match r {
                        Ok(0) => Err(HttpError::connection(
                            ConnectionErrorKind::Closed,
                            Progress::Unsent,
                            "peer closed before response completed",
                        )),
                        Ok(_) => {
                            self.lock().state = ConnectionState::Receiving;
                            Ok(())
                        }
                        Err(e) => Err(HttpError::from_io(&e, Progress::Unsent)),
                    };
                }
                _ = sleep_until(grace_deadline) => {
                    return Err(HttpError::connection(
                        ConnectionErrorKind::Stalled,
                        Progress::Unsent,
                        "no response on reused connection",
                    ));
                }
                _ = sleep_until(response_deadline) => {
                    return Err(HttpError::connection(
                        ConnectionErrorKind::TimedOut,
                        Progress::Unsent,
                        "response timed out",
                    ));
                }
                _ = notified, if awaiting_flush => {}
                _ = closed_signal(closed) => {
                    return Err(HttpError::connection(
                        ConnectionErrorKind::Closed,
                        Progress::Unsent,
                        "connection closed",
                    ));
                }
            }
        }
    }

    /// Read more body bytes. Ok(false) on EOF.
    async fn fill_body(
        &self,
        reader: &mut ReadHalf<HttpStream>,
        buf: &mut BytesMut,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<bool, HttpError> {
        self.lock().state = ConnectionState::Blocked;
        tokio::select! {
            r = reader.read_buf(buf) => match r {
                Ok(0) => Ok(false),
                Ok(_) => {
                    self.lock().state = ConnectionState::Receiving;
                    Ok(true)
                }
                Err(e) => Err(HttpError::from_io(&e, Progress::BodyStarted)),
            },
            _ = response_timeout(self.settings.response_timeout) => Err(HttpError::connection(
                ConnectionErrorKind::TimedOut,
                Progress::BodyStarted,
                "response body timed out",
            )),
            _ = closed_signal(closed) => Err(HttpError::connection(
                ConnectionErrorKind::Closed,
                Progress::BodyStarted,
                "connection closed",
            )),
        }
    }

    /// Parse one response for the oldest in-flight request and stream its body.
    /// Returns Ok(false) if the connection must close afterwards.
    async fn read_response(
        &self,
        reader: &mut ReadHalf<HttpStream>,
        buf: &mut BytesMut,
        parser: &mut ResponseParser,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<bool, ReadFailure> {
        parser.reset();
        let mut events = Events::default();
        let mut seen = !buf.is_empty();
        loop {
            parser.receive(buf, &mut events)?;
            if parser.state() == ParseState::HeadersComplete {
                let interim = matches!(events.status, Some((_, code, _)) if (100..200).contains(&code) && code != 101);
                if !interim {
                    break;
                }
                debug!(conn = self.id, "skipping interim response");
                parser.reset();
                events = Events::default();
                continue;
            }
            self.fill_head(reader, buf, closed, seen).await?;
            seen = true;
        }

        let Some((version, status, reason)) = events.status.take() else {
            return Err(HttpError::syntax("response without status line").into());
        };
        let headers = std::mem::take(&mut events.headers);
        let (method, url) = {
            let shared = self.lock();
            match shared.in_flight.front() {
                Some(p) => (p.method, p.url.clone()),
                None => return Err(HttpError::syntax("response without request").into()),
            }
        };
        let mode = body_mode(method, status, &headers)?;
        let keep_alive = version == HttpVersion::Http1_1
            && !headers.has_token("Connection", "close")
            && mode != BodyMode::UntilClose;
        let responder = {
            let mut shared = self.lock();
            shared.version = Some(version);
            if !keep_alive {
                shared.persistent = false;
            }
            shared.state = ConnectionState::Receiving;
            shared.in_flight.front_mut().and_then(|p| p.responder.take())
        };

        let (body, body_tx) = if mode == BodyMode::None {
            (ResponseBody::empty(), None)
        } else {
            let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
            (ResponseBody::streaming(rx), Some(tx))
        };
        debug!(conn = self.id, status, %version, ?mode, "response head");
        let response = Response {
            status,
            reason,
            version,
            headers,
            body,
            url,
            method,
        };
        let delivered = match responder {
            Some(tx) => tx.send(Ok(response)).is_ok(),
            None => false,
        };
        if !delivered {
            return Err(HttpError::connection(
                ConnectionErrorKind::Cancelled,
                Progress::Unsent,
                "request abandoned after it was sent",
            )
            .into());
        }

        let mut body_tx = body_tx;
        parser.set_body_mode(mode, &mut events);
        loop {
            if let Err(e) = parser.receive(buf, &mut events) {
                return Err(ReadFailure { error: e, body: body_tx });
            }
            let mut consumer_gone = false;
            if let Some(tx) = &body_tx {
                for chunk in events.data.drain(..) {
                    if tx.send(Ok(BodyFrame::Data(chunk))).await.is_err() {
                        consumer_gone = true;
                        break;
                    }
                }
            }
            events.data.clear();
            if consumer_gone {
                debug!(conn = self.id, "response body dropped, discarding remainder");
                body_tx = None;
            }
            if events.complete {
                break;
            }
            match self.fill_body(reader, buf, closed).await {
                Ok(true) => {}
                Ok(false) => {
                    if parser.finish_eof(&mut events) {
                        break;
                    }
                    return Err(ReadFailure {
                        error: HttpError::connection(
                            ConnectionErrorKind::Closed,
                            Progress::BodyStarted,
                            "peer closed during response body",
                        ),
                        body: body_tx,
                    });
                }
                Err(e) => return Err(ReadFailure { error: e, body: body_tx }),
            }
        }
        if let Some(tx) = &body_tx {
            if !events.trailers.is_empty() {
                let trailers = std::mem::take(&mut events.trailers);
                let _ = tx.send(Ok(BodyFrame::Trailers(trailers))).await;
            }
        }

        // release the slot before the body stream ends
        let persistent = {
            let mut shared = self.lock();
            shared.in_flight.pop_front();
            shared.completed += 1;
            shared.persistent
        };
        if persistent {
            self.finish_one();
        }
        drop(body_tx);
        Ok(persistent)
    }
}

async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending::<()>().await,
    }
}

async fn response_timeout(limit: Option<Duration>) {
    match limit {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending::<()>().await,
    }
}

/// Decide how the response body is delimited (RFC 2616 4.4).
pub(crate) fn body_mode(method: Method, status: u16, headers: &Headers) -> Result<BodyMode, HttpError> {
    if method == Method::Head || (100..200).contains(&status) || status == 204 || status == 304 {
        return Ok(BodyMode::None);
    }
    if let Some(te) = headers.combined("Transfer-Encoding") {
        let codings = split_list(&te);
        if codings.iter().any(|c| !c.eq_ignore_ascii_case("identity")) {
            return Ok(match codings.last() {
                Some(last) if last.eq_ignore_ascii_case("chunked") => BodyMode::Chunked,
                _ => BodyMode::UntilClose,
            });
        }
    }
    let mut length: Option<u64> = None;
    for value in headers.get_all("Content-Length") {
        for item in split_list(value) {
            if item.is_empty() || !item.bytes().all(|b| b.is_ascii_digit()) {
                return Err(HttpError::syntax(format!("invalid Content-Length: {:?}", value)));
            }
            let n: u64 = item
                .parse()
                .map_err(|_| HttpError::syntax(format!("invalid Content-Length: {:?}", value)))?;
            if matches!(length, Some(prev) if prev != n) {
                return Err(HttpError::syntax("conflicting Content-Length values"));
            }
            length = Some(n);
        }
    }
    Ok(match length {
        Some(n) => BodyMode::Length(n),
        None => BodyMode::UntilClose,
    })
}

/// Collects parser events for the response being read.
#[derive(Default)]
struct Events {
    status: Option<(HttpVersion, u16, String)>,
    headers: Headers,
    data: Vec<Bytes>,
    trailers: Headers,
    complete: bool,
}

impl H1ResponseHandler for Events {
    fn status(&mut self, version: HttpVersion, code: u16, reason: &str) {
        self.status = Some((version, code, reason.to_string()));
    }

    fn header(&mut self, name: &str, value: &str) {
        self.headers.append(name, value);
    }

    fn body_chunk(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.data.push(data);
        }
    }

    fn trailer(&mut self, name: &str, value: &str) {
        self.trailers.append(name, value);
    }

    fn complete(&mut self) {
        self.complete = true;
    }
}

async fn read_loop(inner: Arc<ConnectionInner>, mut reader: ReadHalf<HttpStream>) {
    let mut closed = inner.closed_tx.subscribe();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut parser = ResponseParser::new();
    let failure = loop {
        match inner.wait_for_request(&mut reader, &mut buf, &mut closed).await {
            Ok(true) => {}
            Ok(false) => break None,
            Err(e) => break Some(ReadFailure::head(e)),
        }
        match inner
            .read_response(&mut reader, &mut buf, &mut parser, &mut closed)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                break Some(ReadFailure::head(HttpError::connection(
                    ConnectionErrorKind::NotPersistent,
                    Progress::Unsent,
                    "connection not persistent",
                )))
            }
            Err(f) => break Some(f),
        }
    };
    drop(reader);
    if let Some(failure) = failure {
        inner.shutdown(failure.error.clone());
        if let Some(tx) = failure.body {
            let _ = tx.send(Err(failure.error)).await;
        }
    }
}

async fn write_loop(
    inner: Arc<ConnectionInner>,
    mut writer: WriteHalf<HttpStream>,
    mut exchange_rx: mpsc::UnboundedReceiver<Exchange>,
) {
    let mut closed = inner.closed_tx.subscribe();
    loop {
        let exchange = tokio::select! {
            biased;
            _ = closed_signal(&mut closed) => break,
            ex = exchange_rx.recv() => match ex {
                Some(ex) => ex,
                None => break,
            },
        };
        let Exchange {
            request,
            responder,
            progress,
        } = exchange;
        if responder.is_closed() {
            debug!(conn = inner.id, "request withdrawn before write");
            inner.finish_one();
            continue;
        }
        let (head, framing) = match encode_head(&request, &inner.target) {
            Ok(h) => h,
            Err(e) => {
                let _ = responder.send(Err(e));
                inner.finish_one();
                continue;
            }
        };
        match inner.wait_turn(&request, responder, &progress, &mut closed).await {
            Turn::Go => {}
            Turn::Skip => {
                debug!(conn = inner.id, "request withdrawn before write");
                inner.finish_one();
                continue;
            }
            Turn::Closed(tx) => {
                let _ = tx.send(Err(HttpError::connection(
                    ConnectionErrorKind::Closed,
                    Progress::Unsent,
                    "connection closed",
                )));
                inner.finish_one();
                break;
            }
        }
        debug!(conn = inner.id, method = %request.method, url = %request.url, "writing request");
        let result = tokio::select! {
            r = write_request(&mut writer, &head, framing, &request.body, &progress) => r,
            _ = closed_signal(&mut closed) => Err(HttpError::connection(
                ConnectionErrorKind::Closed,
                progress.get(),
                "connection closed while writing",
            )),
        };
        match result {
            Ok(()) => inner.mark_flushed(&progress),
            Err(e) => {
                inner.shutdown(e);
                break;
            }
        }
    }
    exchange_rx.close();
    while let Ok(exchange) = exchange_rx.try_recv() {
        let _ = exchange.responder.send(Err(HttpError::connection(
            ConnectionErrorKind::Closed,
            Progress::Unsent,
            "connection closed",
        )));
        inner.finish_one();
    }
}

async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    head: &[u8],
    framing: Framing,
    body: &Body,
    progress: &ProgressCell,
) -> Result<(), HttpError> {
    let io_err = |e: io::Error| HttpError::from_io(&e, progress.get());
    progress.advance(Progress::HeadWritten);
    writer.write_all(head).await.map_err(io_err)?;
    match body {
        Body::Empty => {
            writer.flush().await.map_err(io_err)?;
            progress.advance(Progress::BodyStarted);
        }
        Body::Bytes(data) => {
            progress.advance(Progress::BodyStarted);
            writer.write_all(data).await.map_err(io_err)?;
            writer.flush().await.map_err(io_err)?;
        }
        Body::Stream(open) => {
            let mut source = open();
            let mut chunk = vec![0u8; UPLOAD_CHUNK_SIZE];
            let mut framed = BytesMut::new();
            let mut sent: u64 = 0;
            loop {
                let n = source.read(&mut chunk).await.map_err(|e| {
                    HttpError::connection(
                        ConnectionErrorKind::Reset,
                        progress.get(),
                        format!("request body read failed: {}", e),
                    )
                })?;
                if n == 0 {
                    break;
                }
                progress.advance(Progress::BodyStarted);
                sent += n as u64;
                match framing {
                    Framing::Chunked => {
                        framed.clear();
                        encode_chunk(&chunk[..n], &mut framed);
                        writer.write_all(&framed).await.map_err(io_err)?;
                    }
                    Framing::Length(limit) if sent > limit => {
                        return Err(HttpError::connection(
                            ConnectionErrorKind::Reset,
                            progress.get(),
                            "request body longer than Content-Length",
                        ));
                    }
                    _ => writer.write_all(&chunk[..n]).await.map_err(io_err)?,
                }
            }
            match framing {
                Framing::Chunked => {
                    framed.clear();
                    encode_last_chunk(&Headers::new(), &mut framed);
                    progress.advance(Progress::BodyStarted);
                    writer.write_all(&framed).await.map_err(io_err)?;
                }
                Framing::Length(limit) if sent != limit => {
                    return Err(HttpError::connection(
                        ConnectionErrorKind::Reset,
                        progress.get(),
                        "request body shorter than Content-Length",
                    ));
                }
                _ => {}
            }
            writer.flush().await.map_err(io_err)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn body_mode_precedence() {
        let chunked_and_length = headers(&[("Transfer-Encoding", "chunked"), ("Content-Length", "5")]);
        assert_eq!(body_mode(Method::Get, 200, &chunked_and_length).unwrap(), BodyMode::Chunked);
        assert_eq!(body_mode(Method::Head, 200, &chunked_and_length).unwrap(), BodyMode::None);
        assert_eq!(body_mode(Method::Get, 204, &chunked_and_length).unwrap(), BodyMode::None);
        assert_eq!(body_mode(Method::Get, 304, &Headers::new()).unwrap(), BodyMode::None);
        assert_eq!(
            body_mode(Method::Get, 200, &headers(&[("Content-Length", "12")])).unwrap(),
            BodyMode::Length(12)
        );
        assert_eq!(body_mode(Method::Get, 200, &Headers::new()).unwrap(), BodyMode::UntilClose);
        assert_eq!(
            body_mode(Method::Get, 200, &headers(&[("Transfer-Encoding", "gzip")])).unwrap(),
            BodyMode::UntilClose
        );
    }

    #[test]
    fn bad_content_length_is_syntax_error() {
        let conflicting = headers(&[("Content-Length", "5"), ("Content-Length", "6")]);
        assert!(matches!(body_mode(Method::Get, 200, &conflicting), Err(HttpError::Syntax(_))));
        let repeated = headers(&[("Content-Length", "5, 5")]);
        assert_eq!(body_mode(Method::Get, 200, &repeated).unwrap(), BodyMode::Length(5));
        let junk = headers(&[("Content-Length", "-1")]);
        assert!(matches!(body_mode(Method::Get, 200, &junk), Err(HttpError::Syntax(_))));
    }

    #[test]
    fn progress_cell_only_advances() {
        let cell = ProgressCell::default();
        assert_eq!(cell.get(), Progress::Unsent);
        cell.advance(Progress::BodyStarted);
        cell.advance(Progress::HeadWritten);
        assert_eq!(cell.get(), Progress::BodyStarted);
    }

    async fn connect(addr: std::net::SocketAddr) -> HttpConnection {
        let tcp = TcpStream::connect(addr).await.unwrap();
        let target = Target::new(crate::uri::Scheme::Http, "127.0.0.1", addr.port());
        HttpConnection::start(1, target, HttpStream::Plain(tcp), ConnectionSettings::default(), Arc::new(Notify::new()))
    }

    #[tokio::test]
    async fn idle_connection_claims_once_until_version_known() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = sock.read(&mut buf).await;
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await.unwrap();
            let _ = sock.read(&mut buf).await;
        });
        let conn = connect(addr).await;
        assert!(conn.is_idle());
        let first = conn.try_claim(true).unwrap();
        // version unknown: no pipelining yet
        assert!(conn.try_claim(true).is_none());
        let req = Request::get(&format!("http://{}/", addr)).unwrap();
        let resp = first.send(&req).await.unwrap();
        assert_eq!(resp.version, HttpVersion::Http1_1);
        assert_eq!(&resp.bytes().await.unwrap()[..], b"ok");
        assert_eq!(conn.version(), Some(HttpVersion::Http1_1));
        assert!(conn.is_idle());
        let a = conn.try_claim(true).unwrap();
        let b = conn.try_claim(true);
        assert!(b.is_some());
        assert!(conn.try_claim(false).is_none());
        drop(a);
        drop(b);
        assert_eq!(conn.outstanding(), 0);
        conn.close();
        assert!(conn.is_closed());
        assert!(conn.try_claim(true).is_none());
    }

    #[tokio::test]
    async fn peer_close_while_idle_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock);
        });
        let conn = connect(addr).await;
        for _ in 0..100 {
            if conn.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(conn.is_closed());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
