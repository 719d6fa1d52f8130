/*
 * net.rs
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

//! Transport setup: TCP connect with a timeout, then a rustls handshake for
//! https targets.

use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::rustls::client::ClientConfig;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::RootCertStore;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{ConnectionErrorKind, HttpError, Progress};
use crate::protocol::http::connection::HttpStream;
use crate::uri::Target;

/// Default TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Build a root certificate store: platform native certs first, then webpki-roots as fallback.
fn build_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                let _ = root_store.add(cert);
            }
        }
        Err(e) => debug!(error = %e, "native root certificates unavailable"),
    }
    if root_store.is_empty() {
        root_store.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    }
    root_store
}

/// TLS client config for HTTP/1.1 (ALPN `http/1.1`, no client auth).
pub fn http_client_config() -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(build_root_store())
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

static DEFAULT_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

fn default_config() -> Arc<ClientConfig> {
    DEFAULT_CONFIG.get_or_init(http_client_config).clone()
}

/// Opens transport streams to targets.
#[derive(Clone)]
pub struct Connector {
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl Connector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self::with_tls_config(default_config(), connect_timeout)
    }

    /// Use a caller-supplied rustls config, e.g. with private roots.
    pub fn with_tls_config(config: Arc<ClientConfig>, connect_timeout: Duration) -> Self {
        Self {
            tls: TlsConnector::from(config),
            connect_timeout,
        }
    }

    /// Connect to `target`, completing the TLS handshake for https.
    pub async fn connect(&self, target: &Target) -> Result<HttpStream, HttpError> {
        let addr = target.socket_addr();
        let tcp = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => return Err(HttpError::from_io(&e, Progress::Unsent)),
            Err(_) => {
                return Err(HttpError::connection(
                    ConnectionErrorKind::TimedOut,
                    Progress::Unsent,
                    format!("connect to {} timed out", addr),
                ))
            }
        };
        let _ = tcp.set_nodelay(true);
        if !target.scheme.is_secure() {
            return Ok(HttpStream::Plain(tcp));
        }
        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|_| HttpError::InvalidUrl(format!("invalid TLS server name: {}", target.host)))?;
        let handshake = self.tls.connect(server_name, tcp);
        match tokio::time::timeout(self.connect_timeout, handshake).await {
            Ok(Ok(tls)) => Ok(HttpStream::Tls(Box::new(tls))),
            Ok(Err(e)) => Err(tls_error(&target.host, &e)),
            Err(_) => Err(HttpError::connection(
                ConnectionErrorKind::TimedOut,
                Progress::Unsent,
                format!("TLS handshake with {} timed out", addr),
            )),
        }
    }
}

impl Default for Connector {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT)
    }
}

/// Certificate rejections become `HttpError::Certificate`; anything else is a
/// retryable TLS connection failure.
fn tls_error(host: &str, err: &io::Error) -> HttpError {
    let rustls_err = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<tokio_rustls::rustls::Error>());
    match rustls_err {
        Some(
            e @ (tokio_rustls::rustls::Error::InvalidCertificate(_)
            | tokio_rustls::rustls::Error::NoCertificatesPresented),
        ) => HttpError::Certificate {
            host: host.to_string(),
            message: e.to_string(),
        },
        _ => HttpError::connection(ConnectionErrorKind::Tls, Progress::Unsent, err.to_string()),
    }
}
