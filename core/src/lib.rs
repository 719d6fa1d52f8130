/*
 * lib.rs
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

//! Corriere: an HTTP/1.0 and HTTP/1.1 client engine with persistent
//! connections, pipelining, retry with Fibonacci backoff, redirects,
//! authentication challenges and cookies.

pub mod config;
pub mod error;
pub mod net;
pub mod protocol;
pub mod uri;

pub use config::ClientConfig;
pub use error::{ConnectionErrorKind, HttpError, Progress};
pub use protocol::http::{HttpClient, Request, Response};
