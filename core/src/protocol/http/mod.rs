/*
 * mod.rs
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

//! HTTP/1.x client.
//!
//! Layers, leaves first:
//! - message model: `Headers`, `Request`, `Response`, the H1 writer and incremental parser;
//! - `HttpConnection`: one transport session with a FIFO pipeline, driven by a writer and a reader task;
//! - `ConnectionPool`: per-target reuse, pipelining, creation and queueing policy;
//! - `HttpClient`: redirects, authentication, 417 recovery, cookies and retries.

pub mod auth;
pub mod backoff;
pub mod client;
pub mod connection;
pub mod cookie;
pub mod grammar;
pub mod h1;
pub mod headers;
pub mod pool;
pub mod request;
pub mod response;

pub use auth::{BasicCredentialStore, Challenge, Credential, CredentialStore, ProtectionSpace};
pub use client::HttpClient;
pub use connection::{ConnectionSettings, ConnectionState, HttpConnection, HttpStream, HttpVersion};
pub use cookie::{Cookie, CookieJar, CookieStore};
pub use headers::Headers;
pub use pool::{ConnectionPool, PoolSettings};
pub use request::{Body, Method, Request};
pub use response::{Response, ResponseBody};
