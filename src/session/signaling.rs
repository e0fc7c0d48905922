//! SDP offer/answer exchange over HTTP
//!
//! A single stateless `POST` carries the local offer to the server and
//! returns its answer. There is no trickle ICE: the offer must already contain
//! the gathered candidates.

use reqwest::Client;

use super::protocol::SessionDescriptionPayload;
use super::ConnectionError;

/// Join the server base URL and the offer path
pub fn offer_url(server_url: &str, offer_path: &str) -> String {
    let path = offer_path.trim();
    if path.is_empty() {
        return server_url.trim_end_matches('/').to_string();
    }
    format!(
        "{}/{}",
        server_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// POST the offer and return the server's answer
///
/// # Errors
/// * `SignalingFailure` - network error, non-2xx status, or a body that is
///   not a JSON session description
/// * `NegotiationFailure` - the server answered with something other than an
///   `answer`
pub async fn exchange_offer(
    client: &Client,
    url: &str,
    offer: &SessionDescriptionPayload,
) -> Result<SessionDescriptionPayload, ConnectionError> {
    log::info!("Sending SDP offer to {} ({} bytes)", url, offer.sdp.len());

    let response = client
        .post(url)
        .json(offer)
        .send()
        .await
        .map_err(|e| ConnectionError::SignalingFailure(format!("offer request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ConnectionError::SignalingFailure(format!(
            "offer endpoint returned {}: {}",
            status,
            body.trim()
        )));
    }

    let answer: SessionDescriptionPayload = response
        .json()
        .await
        .map_err(|e| ConnectionError::SignalingFailure(format!("invalid answer payload: {}", e)))?;

    if !answer.is_answer() {
        return Err(ConnectionError::NegotiationFailure(format!(
            "unexpected SDP type from server: {}",
            answer.kind
        )));
    }

    log::info!("Received SDP answer ({} bytes)", answer.sdp.len());
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_url_joins_slashes() {
        assert_eq!(
            offer_url("http://127.0.0.1:8000", "/offer"),
            "http://127.0.0.1:8000/offer"
        );
        assert_eq!(
            offer_url("http://127.0.0.1:8000/", "/offer"),
            "http://127.0.0.1:8000/offer"
        );
        assert_eq!(
            offer_url("http://host/api/", "webrtc/offer"),
            "http://host/api/webrtc/offer"
        );
    }

    #[test]
    fn test_offer_url_empty_path() {
        assert_eq!(offer_url("http://host/offer/", ""), "http://host/offer");
    }
}
