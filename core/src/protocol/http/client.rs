/*
 * client.rs
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

//! Request manager: the public entry point. Drives redirects, authentication
//! challenges, 417 recovery, cookies and retries over the connection pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ConnectionErrorKind, HttpError, Progress};
use crate::net::Connector;
use crate::protocol::http::auth::{Challenge, Credential, CredentialStore};
use crate::protocol::http::backoff::Backoff;
use crate::protocol::http::cookie::{cookie_header, CookieStore};
use crate::protocol::http::pool::{ConnectionPool, WeakPool};
use crate::protocol::http::request::{Body, Method, Request};
use crate::protocol::http::response::Response;
use crate::uri::{resolve_location, same_root};

/// HTTP/1.x client. Cheap to clone; clones share the pool and stores.
#[derive(Clone)]
pub struct HttpClient {
    config: Arc<ClientConfig>,
    pool: ConnectionPool,
    credentials: Option<Arc<dyn CredentialStore>>,
    cookies: Option<Arc<dyn CookieStore>>,
}

/// Which authentication header pair a challenge status uses.
struct AuthHeaders {
    challenge: &'static str,
    authorization: &'static str,
}

fn auth_headers(status: u16) -> Option<AuthHeaders> {
    match status {
        401 => Some(AuthHeaders {
            challenge: "WWW-Authenticate",
            authorization: "Authorization",
        }),
        407 => Some(AuthHeaders {
            challenge: "Proxy-Authenticate",
            authorization: "Proxy-Authorization",
        }),
        _ => None,
    }
}

/// Per-submission state carried across hops.
#[derive(Default)]
struct Attempt {
    redirects: usize,
    /// Credential attached to the current request, and whether it answered a challenge.
    credential: Option<Credential>,
    answered: bool,
    expect_stripped: bool,
}

impl HttpClient {
    pub fn new(config: ClientConfig) -> Result<Self, HttpError> {
        let connector = Connector::new(config.connect_timeout());
        Self::with_connector(config, connector)
    }

    /// Build with a custom connector, e.g. one carrying a private TLS root store.
    pub fn with_connector(config: ClientConfig, connector: Connector) -> Result<Self, HttpError> {
        config.validate()?;
        let pool = ConnectionPool::new(config.pool_settings(), connector);
        Ok(Self {
            config: Arc::new(config),
            pool,
            credentials: None,
            cookies: None,
        })
    }

    pub fn with_credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn with_cookies(mut self, store: Arc<dyn CookieStore>) -> Self {
        self.cookies = Some(store);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Send a request and return the final response.
    ///
    /// 4xx and 5xx responses are returned as `Ok`. Errors are reserved for
    /// transport failures that exhausted their retries, malformed responses and
    /// the redirect, authentication and expectation outcomes of `HttpError`.
    pub async fn submit(&self, mut request: Request) -> Result<Response, HttpError> {
        let caller_cookie = request.headers.contains("Cookie");
        let mut attempt = Attempt::default();
        loop {
            self.prepare(&mut request, caller_cookie, &mut attempt);
            let mut response = self.dispatch(&request).await?;
            if let Some(store) = &self.cookies {
                store.record(&response.url, &response.headers);
            }

            if request.follow_redirects && response.is_redirect() {
                if let Some(location) = response.location() {
                    let next = resolve_location(&request.url, location)?;
                    if attempt.redirects >= self.config.max_redirects {
                        discard(&mut response).await;
                        return Err(HttpError::RedirectLimitExceeded {
                            limit: self.config.max_redirects,
                            location: next.to_string(),
                        });
                    }
                    attempt.redirects += 1;
                    discard(&mut response).await;
                    info!(status = response.status, from = %request.url, to = %next, "following redirect");
                    self.redirect(&mut request, response.status, next, &mut attempt);
                    continue;
                }
            }

            if let Some(names) = auth_headers(response.status) {
                if let Some(store) = &self.credentials {
                    let challenges = parse_challenges(&response, names.challenge);
                    let space = request.target()?;
                    let next = store.lookup(&challenges, &space);
                    match (attempt.credential.take(), next) {
                        (Some(sent), Some(next)) if !attempt.answered && next != sent => {
                            self.answer(&mut request, &names, next, &mut attempt, &mut response).await;
                            continue;
                        }
                        (Some(sent), _) => {
                            warn!(url = %request.url, user = %sent.user, status = response.status, "credential rejected");
                            store.failed(&sent);
                            discard(&mut response).await;
                            return Err(HttpError::AuthenticationFailed {
                                status: response.status,
                                challenges,
                            });
                        }
                        (None, Some(next)) => {
                            self.answer(&mut request, &names, next, &mut attempt, &mut response).await;
                            continue;
                        }
                        (None, None) => return Ok(response),
                    }
                }
                return Ok(response);
            }

            if response.status == 417 {
                if attempt.expect_stripped {
                    discard(&mut response).await;
                    return Err(HttpError::ExpectationFailed);
                }
                if request.headers.remove("Expect") {
                    attempt.expect_stripped = true;
                    discard(&mut response).await;
                    info!(url = %request.url, "expectation failed, resubmitting without Expect");
                    continue;
                }
            }

            if let (Some(store), Some(credential)) = (&self.credentials, &attempt.credential) {
                store.succeeded(credential, &request.url);
            }
            return Ok(response);
        }
    }

    /// Headers derived per hop: cookies, preemptive credential, user agent.
    fn prepare(&self, request: &mut Request, caller_cookie: bool, attempt: &mut Attempt) {
        if !caller_cookie {
            request.headers.remove("Cookie");
            if let Some(store) = &self.cookies {
                if let Some(value) = cookie_header(&store.cookies_for(&request.url)) {
                    request.headers.set("Cookie", value);
                }
            }
        }
        if attempt.credential.is_none() && !request.headers.contains("Authorization") {
            if let Some(credential) = self
                .credentials
                .as_ref()
                .and_then(|store| store.lookup_for_url(&request.url))
            {
                debug!(url = %request.url, user = %credential.user, "sending credential preemptively");
                request.headers.set("Authorization", credential.authorization());
                attempt.credential = Some(credential);
                attempt.answered = false;
            }
        }
        if let Some(agent) = &self.config.user_agent {
            if !request.headers.contains("User-Agent") {
                request.headers.set("User-Agent", agent.clone());
            }
        }
    }

    fn redirect(&self, request: &mut Request, status: u16, next: url::Url, attempt: &mut Attempt) {
        if status == 303 && request.method != Method::Head {
            request.method = Method::Get;
            request.body = Body::Empty;
            for name in ["Content-Length", "Content-Type", "Transfer-Encoding", "Expect"] {
                request.headers.remove(name);
            }
        }
        if !same_root(&request.url, &next) {
            request.headers.remove("Authorization");
            request.headers.remove("Proxy-Authorization");
            request.headers.remove("Host");
            attempt.credential = None;
            attempt.answered = false;
        }
        request.url = next;
    }

    async fn answer(
        &self,
        request: &mut Request,
        names: &AuthHeaders,
        credential: Credential,
        attempt: &mut Attempt,
        response: &mut Response,
    ) {
        discard(response).await;
        info!(url = %request.url, user = %credential.user, status = response.status, "answering authentication challenge");
        request.headers.set(names.authorization, credential.authorization());
        attempt.credential = Some(credential);
        attempt.answered = true;
    }

    /// One hop: acquire a connection and send, retrying transport failures.
    async fn dispatch(&self, request: &Request) -> Result<Response, HttpError> {
        let target = request.target()?;
        let max_retries = request.max_retries.unwrap_or(self.config.max_retries);
        let mut backoff = Backoff::new(self.config.retry_unit(), max_retries, self.config.retry_jitter);
        let idempotent = request.is_idempotent();
        loop {
            let result = match self.pool.acquire(&target, request.is_pipelinable()).await {
                Ok(claimed) => claimed.send(request).await,
                Err(e) => Err(e),
            };
            let err = match result {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            if !err.is_retryable(idempotent) {
                return Err(err);
            }
            match next_retry(&mut backoff, &err) {
                Retry::Now => {
                    debug!(target = %target, error = %err, "request not sent, resubmitting");
                }
                Retry::After(delay) => {
                    warn!(target = %target, attempt = backoff.retries(), delay_ms = delay.as_millis() as u64, error = %err, "retrying request");
                    tokio::time::sleep(delay).await;
                }
                Retry::Exhausted => {
                    warn!(target = %target, retries = backoff.retries(), error = %err, "retries exhausted");
                    return Err(err);
                }
            }
        }
    }

    /// Close connections idle longer than `max_idle_ms`; returns how many.
    pub fn sweep_idle(&self) -> usize {
        self.pool.sweep(self.config.max_idle())
    }

    /// Spawn a task sweeping idle connections every `sweep_interval_ms`.
    ///
    /// Returns `None` when no interval is configured. The task ends once every
    /// client sharing the pool has been dropped.
    pub fn spawn_idle_sweeper(&self) -> Option<JoinHandle<()>> {
        let interval = self.config.sweep_interval()?;
        Some(spawn_sweeper(self.pool.downgrade(), interval, self.config.max_idle()))
    }

    /// Close every connection. Requests in flight fail with `Closed`.
    pub fn close(&self) {
        self.pool.close_all();
    }
}

fn spawn_sweeper(pool: WeakPool, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(pool) = pool.upgrade() else {
                break;
            };
            let closed = pool.sweep(max_idle);
            if closed > 0 {
                debug!(closed, "idle sweep");
            }
        }
    })
}

#[derive(Debug, PartialEq, Eq)]
enum Retry {
    Now,
    After(Duration),
    Exhausted,
}

/// A request that never reached the peer uses up a retry but not a step of
/// the delay sequence.
fn next_retry(backoff: &mut Backoff, err: &HttpError) -> Retry {
    if never_reached_peer(err) {
        return if backoff.retry_now() { Retry::Now } else { Retry::Exhausted };
    }
    match backoff.next_delay() {
        Some(delay) => Retry::After(delay),
        None => Retry::Exhausted,
    }
}

/// The request was queued behind a response that ended the connection; it
/// can go out again at once.
fn never_reached_peer(err: &HttpError) -> bool {
    matches!(
        err,
        HttpError::Connection {
            kind: ConnectionErrorKind::Closed | ConnectionErrorKind::NotPersistent,
            progress: Progress::Unsent,
            ..
        }
    )
}

fn parse_challenges(response: &Response, header: &str) -> Vec<Challenge> {
    let mut out = Vec::new();
    for value in response.headers.get_all(header) {
        match Challenge::parse_list(value) {
            Ok(list) => out.extend(list),
            Err(e) => debug!(header, error = %e, "ignoring malformed challenge"),
        }
    }
    out
}

async fn discard(response: &mut Response) {
    if let Err(e) = response.body.discard().await {
        debug!(url = %response.url, error = %e, "error discarding response body");
    }
}
