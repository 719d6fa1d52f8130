/*
 * http_client.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * End-to-end tests of HttpClient against scripted in-process servers:
 * retries, redirects, pipelining, authentication, cookies and framing.
 *
 * Run with:
 *   cargo test -p corriere_core --test http_client
 */

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ok, status, test_config, Action, MockServer};
use corriere_core::config::ClientConfig;
use corriere_core::error::{HttpError, Progress};
use corriere_core::protocol::http::{
    BasicCredentialStore, Body, CookieJar, Credential, HttpClient, Method, Request,
};
use corriere_core::uri::{Scheme, Target};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

const LIMIT: Duration = Duration::from_secs(10);

fn client(config: ClientConfig) -> HttpClient {
    HttpClient::new(config).unwrap()
}

#[tokio::test]
async fn simple_get() {
    let server = MockServer::start(|_| Action::Reply(ok("hello"))).await;
    let client = client(test_config());
    let response = client.submit(Request::get(&server.url("/greeting?x=1")).unwrap()).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.reason, "OK");
    assert_eq!(response.text().await.unwrap(), "hello");

    let received = server.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].method, "GET");
    assert_eq!(received[0].target, "/greeting?x=1");
    let expected_host = format!("127.0.0.1:{}", server.port);
    assert_eq!(received[0].header("Host"), Some(expected_host.as_str()));
    assert!(received[0].header("User-Agent").unwrap().starts_with("corriere/"));
}

#[tokio::test]
async fn connection_is_reused() {
    let server = MockServer::start(|r| Action::Reply(ok(&r.target))).await;
    let client = client(test_config());
    for path in ["/a", "/b", "/c"] {
        let response = client.submit(Request::get(&server.url(path)).unwrap()).await.unwrap();
        assert_eq!(response.text().await.unwrap(), path);
    }
    assert_eq!(server.connections(), 1);
    assert_eq!(client.pool().connection_count(), 1);
}

#[tokio::test]
async fn idempotent_request_is_resubmitted_once_after_reset() {
    let server = MockServer::start(|r| {
        if r.connection == 0 {
            Action::Close
        } else {
            Action::Reply(ok("second time"))
        }
    })
    .await;
    let client = client(test_config());
    let response = timeout(LIMIT, client.submit(Request::get(&server.url("/")).unwrap()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "second time");
    assert_eq!(server.connections(), 2);
    assert_eq!(server.received().len(), 2);
}

#[tokio::test]
async fn post_is_not_resubmitted_after_body_sent() {
    let server = MockServer::start(|_| Action::Close).await;
    let client = client(test_config());
    let mut request = Request::post(&server.url("/orders")).unwrap();
    request.body(b"item=1".to_vec());
    let err = timeout(LIMIT, client.submit(request)).await.unwrap().unwrap_err();
    assert!(
        matches!(err, HttpError::Connection { progress: Progress::BodyStarted, .. }),
        "{:?}",
        err
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connections(), 1);
    assert_eq!(server.received()[0].body, b"item=1");
}

#[tokio::test]
async fn redirect_302_preserves_method_and_body() {
    let server = MockServer::start(|r| match r.target.as_str() {
        "/start" => Action::Reply(status(302, "Found", &[("Location", "/next")])),
        _ => Action::Reply(ok(&r.method)),
    })
    .await;
    let client = client(test_config());
    let mut request = Request::post(&server.url("/start")).unwrap();
    request.body(b"payload".to_vec());
    let response = client.submit(request).await.unwrap();
    assert_eq!(response.url.path(), "/next");
    assert_eq!(response.text().await.unwrap(), "POST");
    let received = server.received();
    assert_eq!(received[1].body, b"payload");
}

#[tokio::test]
async fn redirect_303_converts_to_get() {
    let server = MockServer::start(|r| match r.target.as_str() {
        "/form" => Action::Reply(status(303, "See Other", &[("Location", "/result")])),
        _ => Action::Reply(ok(&r.method)),
    })
    .await;
    let client = client(test_config());
    let mut request = Request::post(&server.url("/form")).unwrap();
    request.header("Content-Type", "text/plain").body(b"payload".to_vec());
    let response = client.submit(request).await.unwrap();
    assert_eq!(response.method, Method::Get);
    assert_eq!(response.text().await.unwrap(), "GET");
    let received = server.received();
    assert!(received[1].body.is_empty());
    assert!(received[1].header("Content-Type").is_none());
}

#[tokio::test]
async fn redirect_chain_over_limit_is_rejected() {
    let server = MockServer::start(|r| {
        let n: usize = r.target.trim_start_matches("/hop").parse().unwrap_or(0);
        let location = format!("/hop{}", n + 1);
        Action::Reply(status(302, "Found", &[("Location", location.as_str())]))
    })
    .await;
    let client = client(test_config());
    let err = client.submit(Request::get(&server.url("/hop0")).unwrap()).await.unwrap_err();
    match err {
        HttpError::RedirectLimitExceeded { limit, location } => {
            assert_eq!(limit, 5);
            assert!(location.ends_with("/hop6"), "{}", location);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(server.received().len(), 6);
}

#[tokio::test]
async fn redirects_not_followed_when_disabled() {
    let server = MockServer::start(|_| Action::Reply(status(301, "Moved", &[("Location", "/x")]))).await;
    let client = client(test_config());
    let mut request = Request::get(&server.url("/")).unwrap();
    request.follow_redirects = false;
    let response = client.submit(request).await.unwrap();
    assert_eq!(response.status, 301);
    assert_eq!(response.location(), Some("/x"));
}

#[tokio::test]
async fn pipelined_responses_are_delivered_in_order() {
    let server = MockServer::start(|r| match r.index {
        // hold the first pipelined response so both leave in one write
        1 => Action::Defer(ok(&r.target)),
        _ => Action::Reply(ok(&r.target)),
    })
    .await;
    let config = ClientConfig {
        max_connections_per_target: 1,
        ..test_config()
    };
    let client = client(config);
    // learn the peer's version first; pipelining needs a known HTTP/1.1 peer
    let warm = client.submit(Request::get(&server.url("/warm")).unwrap()).await.unwrap();
    warm.text().await.unwrap();

    let first = {
        let client = client.clone();
        let url = server.url("/one");
        tokio::spawn(async move { client.submit(Request::get(&url).unwrap()).await })
    };
    let second = {
        let client = client.clone();
        let url = server.url("/two");
        tokio::spawn(async move { client.submit(Request::get(&url).unwrap()).await })
    };
    let first = timeout(LIMIT, first).await.unwrap().unwrap().unwrap();
    let second = timeout(LIMIT, second).await.unwrap().unwrap().unwrap();
    assert_eq!(first.text().await.unwrap(), "/one");
    assert_eq!(second.text().await.unwrap(), "/two");
    assert_eq!(server.connections(), 1);
    assert_eq!(server.received().len(), 3);
}

#[tokio::test]
async fn retry_delays_follow_fibonacci() {
    let server = MockServer::start(|_| Action::Close).await;
    let config = ClientConfig {
        retry_unit_ms: 40,
        max_retries: 4,
        ..test_config()
    };
    let client = client(config);
    let err = timeout(LIMIT, client.submit(Request::get(&server.url("/flaky")).unwrap()))
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_connection(), "{:?}", err);
    let times = server.accept_times();
    assert_eq!(times.len(), 5);
    let expected = [40u64, 40, 80, 120];
    for (i, want) in expected.iter().enumerate() {
        let gap = times[i + 1].duration_since(times[i]);
        assert!(gap >= Duration::from_millis(*want), "gap {} was {:?}", i, gap);
    }
}

#[tokio::test]
async fn per_request_retry_limit() {
    let server = MockServer::start(|_| Action::Close).await;
    let client = client(test_config());
    let mut request = Request::get(&server.url("/")).unwrap();
    request.max_retries = Some(0);
    assert!(client.submit(request).await.is_err());
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn refused_connection_surfaces_after_retries() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = ClientConfig {
        max_retries: 1,
        ..test_config()
    };
    let client = client(config);
    let err = client
        .submit(Request::get(&format!("http://127.0.0.1:{}/", port)).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, HttpError::Connection { progress: Progress::Unsent, .. }), "{:?}", err);
}

#[tokio::test]
async fn idle_connections_are_swept() {
    let server = MockServer::start(|_| Action::Reply(ok("x"))).await;
    let config = ClientConfig {
        max_idle_ms: 50,
        ..test_config()
    };
    let client = client(config);
    let response = client.submit(Request::get(&server.url("/")).unwrap()).await.unwrap();
    response.text().await.unwrap();
    assert_eq!(client.pool().connection_count(), 1);
    assert_eq!(client.sweep_idle(), 0);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(client.sweep_idle(), 1);
    assert_eq!(client.pool().connection_count(), 0);
}

#[tokio::test]
async fn background_sweeper_closes_idle_connections() {
    let server = MockServer::start(|_| Action::Reply(ok("x"))).await;
    let config = ClientConfig {
        max_idle_ms: 30,
        sweep_interval_ms: Some(20),
        ..test_config()
    };
    let client = client(config);
    let sweeper = client.spawn_idle_sweeper().unwrap();
    let response = client.submit(Request::get(&server.url("/")).unwrap()).await.unwrap();
    response.text().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.pool().connection_count(), 0);
    drop(client);
    timeout(LIMIT, sweeper).await.unwrap().unwrap();
}

fn protected(expected: &'static str) -> impl Fn(&common::Received) -> Action + Send + Sync {
    move |r| {
        if r.header("Authorization") == Some(expected) {
            Action::Reply(ok("secret"))
        } else {
            Action::Reply(status(401, "Unauthorized", &[("WWW-Authenticate", "Basic realm=\"vault\"")]))
        }
    }
}

#[tokio::test]
async fn basic_challenge_is_answered() {
    // "u:p"
    let server = MockServer::start(protected("Basic dTpw")).await;
    let store = Arc::new(BasicCredentialStore::new());
    let space = Target::new(Scheme::Http, "127.0.0.1", server.port);
    store.add(Credential::basic(space, Some("vault".into()), "u", "p"));
    let client = client(test_config()).with_credentials(store);

    let response = client.submit(Request::get(&server.url("/vault/a")).unwrap()).await.unwrap();
    assert_eq!(response.text().await.unwrap(), "secret");
    let received = server.received();
    assert_eq!(received.len(), 2);
    assert!(received[0].header("Authorization").is_none());

    // same directory: sent preemptively
    let response = client.submit(Request::get(&server.url("/vault/b")).unwrap()).await.unwrap();
    assert_eq!(response.status, 200);
    let received = server.received();
    assert_eq!(received.len(), 3);
    assert_eq!(received[2].header("Authorization"), Some("Basic dTpw"));
}

#[tokio::test]
async fn repeated_challenge_is_authentication_failure() {
    let server = MockServer::start(protected("Basic nobody")).await;
    let store = Arc::new(BasicCredentialStore::new());
    let space = Target::new(Scheme::Http, "127.0.0.1", server.port);
    store.add(Credential::basic(space, None, "u", "wrong"));
    let client = client(test_config()).with_credentials(store.clone());

    let err = client.submit(Request::get(&server.url("/vault/a")).unwrap()).await.unwrap_err();
    match err {
        HttpError::AuthenticationFailed { status, challenges } => {
            assert_eq!(status, 401);
            assert_eq!(challenges[0].realm(), Some("vault"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(server.received().len(), 2);
    assert!(store.is_empty());
}

#[tokio::test]
async fn challenge_without_credential_is_returned() {
    let server = MockServer::start(protected("Basic dTpw")).await;
    let client = client(test_config());
    let response = client.submit(Request::get(&server.url("/vault/a")).unwrap()).await.unwrap();
    assert_eq!(response.status, 401);
    assert_eq!(server.received().len(), 1);
}

#[tokio::test]
async fn expectation_failure_resubmits_without_expect() {
    let server = MockServer::start(|r| {
        if r.header("Expect").is_some() {
            Action::Reply(status(417, "Expectation Failed", &[]))
        } else {
            Action::Reply(ok("stored"))
        }
    })
    .await;
    let client = client(test_config());
    let mut request = Request::new(Method::Put, &server.url("/doc")).unwrap();
    request.header("Expect", "100-continue").body(b"content".to_vec());
    let response = client.submit(request).await.unwrap();
    assert_eq!(response.text().await.unwrap(), "stored");
    let received = server.received();
    assert_eq!(received.len(), 2);
    assert!(received[1].header("Expect").is_none());
    assert_eq!(received[1].body, b"content");
}

#[tokio::test]
async fn persistent_expectation_failure() {
    let server = MockServer::start(|_| Action::Reply(status(417, "Expectation Failed", &[]))).await;
    let client = client(test_config());
    let mut request = Request::new(Method::Put, &server.url("/doc")).unwrap();
    request.header("Expect", "100-continue").body(b"content".to_vec());
    let err = client.submit(request).await.unwrap_err();
    assert!(matches!(err, HttpError::ExpectationFailed), "{:?}", err);
}

#[tokio::test]
async fn cookies_flow_between_requests() {
    let server = MockServer::start(|r| match r.target.as_str() {
        "/login" => Action::Reply(status(
            302,
            "Found",
            &[("Set-Cookie", "sid=abc; Path=/"), ("Location", "/home")],
        )),
        _ => Action::Reply(ok(r.header("Cookie").unwrap_or("none"))),
    })
    .await;
    let jar = Arc::new(CookieJar::new());
    let client = client(test_config()).with_cookies(jar.clone());
    let response = client.submit(Request::get(&server.url("/login")).unwrap()).await.unwrap();
    assert_eq!(response.text().await.unwrap(), "sid=abc");
    assert_eq!(jar.len(), 1);

    let mut own = Request::get(&server.url("/home")).unwrap();
    own.header("Cookie", "mine=1");
    let response = client.submit(own).await.unwrap();
    assert_eq!(response.text().await.unwrap(), "mine=1");
}

#[tokio::test]
async fn chunked_response_with_trailers() {
    let server = MockServer::start(|_| {
        Action::Reply(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
             5\r\nhello\r\n7;ext=1\r\n, world\r\n0\r\nX-Checksum: 42\r\n\r\n"
                .to_string(),
        )
    })
    .await;
    let client = client(test_config());
    let mut response = client.submit(Request::get(&server.url("/")).unwrap()).await.unwrap();
    let mut body = Vec::new();
    while let Some(chunk) = response.body.chunk().await {
        body.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(body, b"hello, world");
    assert_eq!(response.body.trailers().get("X-Checksum"), Some("42"));
}

#[tokio::test]
async fn streamed_upload_is_chunked() {
    let server = MockServer::start(|r| Action::Reply(ok(&r.body.len().to_string()))).await;
    let client = client(test_config());
    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let mut request = Request::post(&server.url("/upload")).unwrap();
    request.body(Body::stream(move || std::io::Cursor::new(payload.clone())));
    let response = client.submit(request).await.unwrap();
    assert_eq!(response.text().await.unwrap(), "50000");
    let received = server.received();
    assert_eq!(received[0].header("Transfer-Encoding"), Some("chunked"));
    assert_eq!(received[0].body, expected);
}

#[tokio::test]
async fn response_timer_starts_after_upload() {
    let server = MockServer::start(|r| Action::Reply(ok(&r.body.len().to_string()))).await;
    let config = ClientConfig {
        response_timeout_ms: Some(300),
        ..test_config()
    };
    let client = client(config);
    let mut request = Request::new(Method::Put, &server.url("/slow")).unwrap();
    request.body(Body::stream(|| {
        let (mut tx, rx) = tokio::io::duplex(64);
        tokio::spawn(async move {
            for _ in 0..8 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if tx.write_all(b"x").await.is_err() {
                    return;
                }
            }
        });
        rx
    }));
    let response = timeout(LIMIT, client.submit(request)).await.unwrap().unwrap();
    assert_eq!(response.text().await.unwrap(), "8");
    assert_eq!(server.connections(), 1);
    assert_eq!(server.received().len(), 1);
}

#[tokio::test]
async fn abandoning_an_in_flight_request_closes_its_connection() {
    let server = MockServer::start(|_| Action::Hang).await;
    let client = client(test_config());
    let abandoned = timeout(
        Duration::from_millis(200),
        client.submit(Request::get(&server.url("/slow")).unwrap()),
    )
    .await;
    assert!(abandoned.is_err());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.received().len(), 1);
    assert_eq!(client.pool().connection_count(), 0);
}

#[tokio::test]
async fn http10_response_is_not_persistent() {
    let server = MockServer::start(|_| {
        Action::ReplyClose("HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nok".to_string())
    })
    .await;
    let client = client(test_config());
    for _ in 0..2 {
        let response = client.submit(Request::get(&server.url("/")).unwrap()).await.unwrap();
        assert_eq!(response.text().await.unwrap(), "ok");
    }
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn body_until_close() {
    let server = MockServer::start(|_| {
        Action::ReplyClose("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nall of it".to_string())
    })
    .await;
    let client = client(test_config());
    let response = client.submit(Request::get(&server.url("/")).unwrap()).await.unwrap();
    assert_eq!(response.text().await.unwrap(), "all of it");
}

#[tokio::test]
async fn stalled_reused_connection_is_replaced() {
    let server = MockServer::start(|r| match (r.connection, r.index) {
        (0, 0) => Action::Reply(ok("first")),
        (0, _) => Action::Hang,
        _ => Action::Reply(ok("fresh")),
    })
    .await;
    let config = ClientConfig {
        blocked_grace_ms: Some(200),
        ..test_config()
    };
    let client = client(config);
    let response = client.submit(Request::get(&server.url("/a")).unwrap()).await.unwrap();
    assert_eq!(response.text().await.unwrap(), "first");
    let response = timeout(LIMIT, client.submit(Request::get(&server.url("/b")).unwrap()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "fresh");
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn malformed_response_is_syntax_error() {
    let server = MockServer::start(|_| Action::ReplyClose("NOT-HTTP garbage\r\n\r\n".to_string())).await;
    let client = client(test_config());
    let err = client.submit(Request::get(&server.url("/")).unwrap()).await.unwrap_err();
    assert!(matches!(err, HttpError::Syntax(_)), "{:?}", err);
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn closed_client_rejects_requests() {
    let server = MockServer::start(|_| Action::Reply(ok("x"))).await;
    let client = client(test_config());
    client.close();
    let err = client.submit(Request::get(&server.url("/")).unwrap()).await.unwrap_err();
    assert!(matches!(err, HttpError::Closed), "{:?}", err);
}
