/*
 * backoff.rs
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

//! Fibonacci retry backoff.

use std::time::Duration;

use rand::Rng;

/// Retry count and delay sequence for one submission hop.
///
/// Delays are `unit` times 1, 1, 2, 3, 5, ... With jitter each delay is scaled
/// by a random factor in (0.75, 1.25].
#[derive(Debug, Clone)]
pub struct Backoff {
    unit: Duration,
    max_retries: u32,
    jitter: bool,
    retries: u32,
    current: u64,
    next: u64,
}

impl Backoff {
    pub fn new(unit: Duration, max_retries: u32, jitter: bool) -> Self {
        Self {
            unit,
            max_retries,
            jitter,
            retries: 0,
            current: 1,
            next: 1,
        }
    }

    /// Retries taken so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }

    /// Delay before the next retry, or `None` once every retry is used.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.retries += 1;
        let factor = self.current;
        let following = self.current.saturating_add(self.next);
        self.current = self.next;
        self.next = following;
        let base = self.unit.saturating_mul(factor.min(u32::MAX as u64) as u32);
        if self.jitter {
            let r: f64 = rand::thread_rng().gen();
            Some(base.mul_f64((5.0 - 2.0 * r) / 4.0))
        } else {
            Some(base)
        }
    }

    /// Take a retry with no delay. The delay sequence does not advance.
    pub fn retry_now(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.retries += 1;
        true
    }
}
