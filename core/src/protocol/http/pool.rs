/*
 * pool.rs
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

//! Connection pool: target to connections, with reuse, pipelining, creation
//! under global and per-target caps, and a bounded queue of waiters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::HttpError;
use crate::net::Connector;
use crate::protocol::http::connection::{Claimed, ConnectionSettings, HttpConnection};
use crate::uri::Target;

/// Pool limits.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub max_per_target: usize,
    /// Callers that may queue for a connection before `Busy` is returned.
    pub max_waiters: usize,
    pub acquire_timeout: Option<Duration>,
    pub connection: ConnectionSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_per_target: 4,
            max_waiters: 64,
            acquire_timeout: None,
            connection: ConnectionSettings::default(),
        }
    }
}

#[derive(Default)]
struct PoolState {
    targets: HashMap<Target, Vec<HttpConnection>>,
    /// Connections being established, per target.
    connecting: HashMap<Target, usize>,
    waiters: usize,
    closing: bool,
}

impl PoolState {
    fn prune(&mut self) {
        for conns in self.targets.values_mut() {
            conns.retain(|c| !c.is_closed());
        }
        self.targets.retain(|_, conns| !conns.is_empty());
    }

    fn total(&self) -> usize {
        self.targets.values().map(Vec::len).sum::<usize>() + self.connecting.values().sum::<usize>()
    }

    fn count_for(&self, target: &Target) -> usize {
        self.targets.get(target).map_or(0, Vec::len) + self.connecting.get(target).copied().unwrap_or(0)
    }
}

struct PoolInner {
    settings: PoolSettings,
    connector: Connector,
    state: Mutex<PoolState>,
    released: Arc<Notify>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for conn in state.targets.drain().flat_map(|(_, conns)| conns) {
            conn.close();
        }
    }
}

enum Step {
    Claimed(Claimed),
    /// A connecting slot was reserved; close the evicted connection, if any, first.
    Connect(Option<HttpConnection>),
    Wait,
}

/// Shared pool of connections. Cheaply cloneable.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// Releases a connecting reservation if the connect future is dropped.
struct ConnectingSlot<'a> {
    pool: &'a PoolInner,
    target: Target,
}

impl Drop for ConnectingSlot<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.pool.lock();
            if let Some(n) = state.connecting.get_mut(&self.target) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    state.connecting.remove(&self.target);
                }
            }
        }
        self.pool.released.notify_waiters();
    }
}

/// Counts a queued caller; released on drop.
struct WaiterSlot<'a> {
    pool: &'a PoolInner,
}

impl Drop for WaiterSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        state.waiters = state.waiters.saturating_sub(1);
    }
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings, connector: Connector) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                settings,
                connector,
                state: Mutex::new(PoolState::default()),
                released: Arc::new(Notify::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Claim a slot on a connection to `target`, creating or waiting as needed.
    pub async fn acquire(&self, target: &Target, pipelinable: bool) -> Result<Claimed, HttpError> {
        let deadline = self
            .inner
            .settings
            .acquire_timeout
            .map(|t| tokio::time::Instant::now() + t);
        let mut waiter: Option<WaiterSlot<'_>> = None;
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.inner.lock();
                if state.closing {
                    return Err(HttpError::Closed);
                }
                state.prune();
                let step = self.plan(&mut state, target, pipelinable);
                if matches!(step, Step::Wait) && waiter.is_none() {
                    if state.waiters >= self.inner.settings.max_waiters {
                        debug!(target = %target, waiters = state.waiters, "pool busy");
                        return Err(HttpError::Busy {
                            target: target.to_string(),
                        });
                    }
                    state.waiters += 1;
                    waiter = Some(WaiterSlot { pool: &self.inner });
                }
                step
            };

            match step {
                Step::Claimed(claimed) => return Ok(claimed),
                Step::Connect(evicted) => {
                    drop(waiter.take());
                    if let Some(old) = evicted {
                        info!(conn = old.id(), target = %old.target(), "evicting idle connection");
                        old.close();
                    }
                    return self.connect(target).await;
                }
                Step::Wait => match deadline {
                    Some(at) => {
                        if tokio::time::timeout_at(at, notified).await.is_err() {
                            return Err(HttpError::Busy {
                                target: target.to_string(),
                            });
                        }
                    }
                    None => notified.await,
                },
            }
        }
    }

    /// Decide what `acquire` does next. Called with the pool lock held.
    fn plan(&self, state: &mut PoolState, target: &Target, pipelinable: bool) -> Step {
        let settings = &self.inner.settings;
        if let Some(conns) = state.targets.get(target) {
            // most recently active idle connection
            let mut idle: Vec<&HttpConnection> = conns.iter().filter(|c| c.is_idle()).collect();
            idle.sort_by_key(|c| std::cmp::Reverse(c.last_active()));
            for conn in idle {
                if let Some(claimed) = conn.try_claim(pipelinable) {
                    return Step::Claimed(claimed);
                }
            }
            if pipelinable {
                let mut open: Vec<&HttpConnection> = conns.iter().filter(|c| c.can_pipeline()).collect();
                open.sort_by_key(|c| c.outstanding());
                for conn in open {
                    if let Some(claimed) = conn.try_claim(true) {
                        return Step::Claimed(claimed);
                    }
                }
            }
        }

        if state.count_for(target) >= settings.max_per_target {
            return Step::Wait;
        }
        let mut evicted = None;
        if state.total() >= settings.max_connections {
            let oldest = state
                .targets
                .iter()
                .filter(|(t, _)| *t != target)
                .flat_map(|(t, conns)| conns.iter().filter(|c| c.is_idle()).map(move |c| (t.clone(), c.clone())))
                .min_by_key(|(_, c)| c.last_active());
            let Some((victim_target, victim)) = oldest else {
                return Step::Wait;
            };
            if let Some(conns) = state.targets.get_mut(&victim_target) {
                conns.retain(|c| c.id() != victim.id());
            }
            evicted = Some(victim);
        }
        *state.connecting.entry(target.clone()).or_insert(0) += 1;
        Step::Connect(evicted)
    }

    async fn connect(&self, target: &Target) -> Result<Claimed, HttpError> {
        let slot = ConnectingSlot {
            pool: &self.inner,
            target: target.clone(),
        };
        let stream = self.inner.connector.connect(target).await?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = HttpConnection::start(
            id,
            target.clone(),
            stream,
            self.inner.settings.connection.clone(),
            self.inner.released.clone(),
        );
        let claimed = conn.try_claim(false);
        {
            let mut state = self.inner.lock();
            if state.closing {
                drop(state);
                conn.close();
                return Err(HttpError::Closed);
            }
            state.targets.entry(target.clone()).or_default().push(conn);
        }
        drop(slot);
        claimed.ok_or(HttpError::Closed)
    }

    /// Close connections idle for at least `max_idle`; returns how many were closed.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let expired: Vec<HttpConnection> = {
            let mut state = self.inner.lock();
            state.prune();
            let mut expired = Vec::new();
            for conns in state.targets.values_mut() {
                conns.retain(|c| {
                    if c.is_idle() && c.idle_for() >= max_idle {
                        expired.push(c.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            state.targets.retain(|_, conns| !conns.is_empty());
            expired
        };
        for conn in &expired {
            debug!(conn = conn.id(), target = %conn.target(), "closing idle connection");
            conn.close();
        }
        expired.len()
    }

    /// Close every connection and refuse further acquisitions.
    pub fn close_all(&self) {
        let conns: Vec<HttpConnection> = {
            let mut state = self.inner.lock();
            state.closing = true;
            state.targets.drain().flat_map(|(_, conns)| conns).collect()
        };
        for conn in conns {
            conn.close();
        }
        self.inner.released.notify_waiters();
    }

    /// Open connections (closed ones are pruned first).
    pub fn connection_count(&self) -> usize {
        let mut state = self.inner.lock();
        state.prune();
        state.targets.values().map(Vec::len).sum()
    }

    pub fn connection_count_for(&self, target: &Target) -> usize {
        let mut state = self.inner.lock();
        state.prune();
        state.targets.get(target).map_or(0, Vec::len)
    }

    pub fn idle_count(&self) -> usize {
        let mut state = self.inner.lock();
        state.prune();
        state
            .targets
            .values()
            .flat_map(|conns| conns.iter())
            .filter(|c| c.is_idle())
            .count()
    }

    /// Handle that does not keep the pool alive, for background tasks.
    pub fn downgrade(&self) -> WeakPool {
        WeakPool(Arc::downgrade(&self.inner))
    }
}

/// Non-owning pool handle.
#[derive(Clone)]
pub struct WeakPool(Weak<PoolInner>);

impl WeakPool {
    pub fn upgrade(&self) -> Option<ConnectionPool> {
        self.0.upgrade().map(|inner| ConnectionPool { inner })
    }
}
