//! Integration tests for the offer/answer exchange
//!
//! A one-shot HTTP server on a loopback port stands in for the voice-chat
//! server, so these run without network access.
//!
//! ```bash
//! cargo test --test signaling
//! ```

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use voice_chat::session::{exchange_offer, offer_url, ConnectionError, SessionDescriptionPayload};

/// Serve exactly one request with the given status and body.
/// The join handle yields the raw request (headers + body).
async fn one_shot_server(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;

        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        request
    });

    (format!("http://{}", addr), handle)
}

/// Read headers, then as many body bytes as Content-Length says
async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);

        let text = String::from_utf8_lossy(&data);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if data.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }

    String::from_utf8_lossy(&data).into_owned()
}

#[tokio::test]
async fn offer_is_posted_and_answer_returned() {
    let (base, server) =
        one_shot_server("200 OK", r#"{"sdp": "v=0\r\nanswer", "type": "answer"}"#).await;
    let client = reqwest::Client::new();

    let answer = exchange_offer(
        &client,
        &offer_url(&base, "/offer"),
        &SessionDescriptionPayload::offer("v=0\r\noffer"),
    )
    .await
    .unwrap();

    assert_eq!(answer.sdp, "v=0\r\nanswer");
    assert!(answer.is_answer());

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /offer HTTP/1.1"));
    assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
    let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
    let sent: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(sent["type"], "offer");
    assert_eq!(sent["sdp"], "v=0\r\noffer");
}

#[tokio::test]
async fn non_success_status_is_signaling_failure() {
    let (base, server) = one_shot_server("500 Internal Server Error", r#"{"detail": "boom"}"#).await;
    let client = reqwest::Client::new();

    let err = exchange_offer(
        &client,
        &offer_url(&base, "/offer"),
        &SessionDescriptionPayload::offer("v=0"),
    )
    .await
    .unwrap_err();

    match err {
        ConnectionError::SignalingFailure(msg) => {
            assert!(msg.contains("500"));
            assert!(msg.contains("boom"));
        }
        other => panic!("Expected SignalingFailure, got {:?}", other),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn malformed_answer_is_signaling_failure() {
    let (base, server) = one_shot_server("200 OK", r#"{"unexpected": true}"#).await;
    let client = reqwest::Client::new();

    let err = exchange_offer(
        &client,
        &offer_url(&base, "/offer"),
        &SessionDescriptionPayload::offer("v=0"),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ConnectionError::SignalingFailure(_)), "{:?}", err);
    server.await.unwrap();
}

#[tokio::test]
async fn wrong_sdp_type_is_negotiation_failure() {
    let (base, server) = one_shot_server("200 OK", r#"{"sdp": "v=0", "type": "offer"}"#).await;
    let client = reqwest::Client::new();

    let err = exchange_offer(
        &client,
        &offer_url(&base, "/offer"),
        &SessionDescriptionPayload::offer("v=0"),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ConnectionError::NegotiationFailure(_)), "{:?}", err);
    assert!(err.is_fatal());
    server.await.unwrap();
}

#[tokio::test]
async fn unreachable_server_is_signaling_failure() {
    // Bind then drop to get a port nothing listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = reqwest::Client::new();
    let err = exchange_offer(
        &client,
        &format!("http://{}/offer", addr),
        &SessionDescriptionPayload::offer("v=0"),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ConnectionError::SignalingFailure(_)), "{:?}", err);
}
