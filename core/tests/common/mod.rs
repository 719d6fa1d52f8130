/*
 * mod.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Scripted in-process HTTP/1.1 server for the integration tests. Each
 * request is handed to a closure that decides what goes back on the wire.
 */

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use corriere_core::config::ClientConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// A request as the server received it.
#[derive(Debug, Clone)]
pub struct Received {
    /// Index of the accepted connection, from 0.
    pub connection: usize,
    /// Index of the request on its connection, from 0.
    pub index: usize,
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Received {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// What the server does with one request.
pub enum Action {
    /// Write this response (after anything deferred) and keep reading.
    Reply(String),
    /// Hold this response until the next `Reply`.
    Defer(String),
    /// Write this response and close.
    ReplyClose(String),
    /// Close without answering.
    Close,
    /// Never answer; keep the socket open.
    Hang,
}

type Script = dyn Fn(&Received) -> Action + Send + Sync;

pub struct MockServer {
    pub port: u16,
    accepts: Arc<Mutex<Vec<Instant>>>,
    received: Arc<Mutex<Vec<Received>>>,
}

impl MockServer {
    pub async fn start<F>(script: F) -> MockServer
    where
        F: Fn(&Received) -> Action + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepts = Arc::new(Mutex::new(Vec::new()));
        let received = Arc::new(Mutex::new(Vec::new()));
        let script: Arc<Script> = Arc::new(script);
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let accepts = accepts.clone();
            let received = received.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    accepts.lock().unwrap().push(Instant::now());
                    let connection = counter.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        stream,
                        connection,
                        script.clone(),
                        received.clone(),
                    ));
                }
            });
        }
        MockServer {
            port,
            accepts,
            received,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn connections(&self) -> usize {
        self.accepts.lock().unwrap().len()
    }

    pub fn accept_times(&self) -> Vec<Instant> {
        self.accepts.lock().unwrap().clone()
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }
}

async fn serve(
    mut stream: tokio::net::TcpStream,
    connection: usize,
    script: Arc<Script>,
    received: Arc<Mutex<Vec<Received>>>,
) {
    let mut buf = Vec::new();
    let mut deferred = String::new();
    let mut index = 0;
    loop {
        let Some(mut request) = read_request(&mut stream, &mut buf).await else {
            return;
        };
        request.connection = connection;
        request.index = index;
        index += 1;
        received.lock().unwrap().push(request.clone());
        match script(&request) {
            Action::Reply(response) => {
                deferred.push_str(&response);
                if stream.write_all(deferred.as_bytes()).await.is_err() {
                    return;
                }
                deferred.clear();
            }
            Action::Defer(response) => deferred.push_str(&response),
            Action::ReplyClose(response) => {
                deferred.push_str(&response);
                let _ = stream.write_all(deferred.as_bytes()).await;
                let _ = stream.shutdown().await;
                return;
            }
            Action::Close => return,
            Action::Hang => {
                std::future::pending::<()>().await;
            }
        }
    }
}

async fn fill<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut Vec<u8>) -> bool {
    let mut chunk = [0u8; 4096];
    match stream.read(&mut chunk).await {
        Ok(0) | Err(_) => false,
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            true
        }
    }
}

fn find(buf: &[u8], needle: &[u8]) -> Option<usize> {
    buf.windows(needle.len()).position(|w| w == needle)
}

async fn read_line<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut Vec<u8>) -> Option<String> {
    loop {
        if let Some(i) = find(buf, b"\r\n") {
            let line = String::from_utf8_lossy(&buf[..i]).into_owned();
            buf.drain(..i + 2);
            return Some(line);
        }
        if !fill(stream, buf).await {
            return None;
        }
    }
}

async fn read_exact<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut Vec<u8>, n: usize) -> Option<Vec<u8>> {
    while buf.len() < n {
        if !fill(stream, buf).await {
            return None;
        }
    }
    Some(buf.drain(..n).collect())
}

async fn read_request<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut Vec<u8>) -> Option<Received> {
    let request_line = read_line(stream, buf).await?;
    let mut parts = request_line.split(' ');
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    let mut headers = Vec::new();
    loop {
        let line = read_line(stream, buf).await?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    let mut request = Received {
        connection: 0,
        index: 0,
        method,
        target,
        headers,
        body: Vec::new(),
    };
    if request
        .header("Transfer-Encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        loop {
            let size_line = read_line(stream, buf).await?;
            let size = usize::from_str_radix(size_line.split(';').next()?.trim(), 16).ok()?;
            if size == 0 {
                while !read_line(stream, buf).await?.is_empty() {}
                break;
            }
            let data = read_exact(stream, buf, size).await?;
            request.body.extend_from_slice(&data);
            read_exact(stream, buf, 2).await?;
        }
    } else if let Some(length) = request.header("Content-Length") {
        let length: usize = length.parse().ok()?;
        request.body = read_exact(stream, buf, length).await?;
    }
    Some(request)
}

/// A 200 response with a text body.
pub fn ok(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

/// An empty response with extra header lines.
pub fn status(code: u16, reason: &str, headers: &[(&str, &str)]) -> String {
    let mut out = format!("HTTP/1.1 {} {}\r\n", code, reason);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("Content-Length: 0\r\n\r\n");
    out
}

/// Defaults with fast retries, for tests.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        retry_unit_ms: 10,
        connect_timeout_ms: 2_000,
        response_timeout_ms: Some(5_000),
        ..ClientConfig::default()
    }
}
