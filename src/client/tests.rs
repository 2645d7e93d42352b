use async_trait::async_trait;
use serde_json::json;

use super::*;
use crate::transport::MockHttpTransport;

const SERVER: &str = "https://lp.vk.com/wh1";

fn session(ts: u64) -> LongPollSession {
    LongPollSession::new(SERVER, "k1", ts).unwrap()
}

fn client_returning(body: Value) -> LongPollClient {
    let mut mock_transport = MockHttpTransport::new();
    mock_transport.expect_get_json().times(1).returning(move |_, _| Ok(body.clone()));
    LongPollClient::new(Arc::new(mock_transport), 30, Duration::from_secs(35))
}

// A transport whose requests never complete.
struct HangingTransport;

#[async_trait]
impl HttpTransport for HangingTransport {
    async fn get_json(
        &self,
        _url: &str,
        _params: &[(String, String)],
    ) -> crate::transport::Result<Value> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_poll_sends_a_check_request() {
    // Arrange
    let mut mock_transport = MockHttpTransport::new();
    mock_transport
        .expect_get_json()
        .withf(|url, params| {
            url == SERVER
                && params
                    == [
                        ("act".to_string(), "a_check".to_string()),
                        ("key".to_string(), "k1".to_string()),
                        ("ts".to_string(), "100".to_string()),
                        ("wait".to_string(), "30".to_string()),
                    ]
        })
        .times(1)
        .returning(|_, _| Ok(json!({"ts": "100", "updates": []})));
    let client = LongPollClient::new(Arc::new(mock_transport), 30, Duration::from_secs(35));

    // Act
    let outcome = client.poll(&session(100)).await;

    // Assert
    assert!(matches!(outcome, PollOutcome::Continue { ts: 100, ref events } if events.is_empty()));
}

#[tokio::test]
async fn test_poll_continue_decodes_message_new() {
    let client = client_returning(json!({
        "ts": "105",
        "updates": [{
            "type": "message_new",
            "object": {"message": {"from_id": 7, "text": "kek", "id": 1}},
            "group_id": 42
        }]
    }));

    let outcome = client.poll(&session(100)).await;

    match outcome {
        PollOutcome::Continue { ts, events } => {
            assert_eq!(ts, 105);
            assert_eq!(
                events,
                vec![RawEvent {
                    kind: MESSAGE_NEW.to_string(),
                    payload: json!({"message": {"from_id": 7, "text": "kek", "id": 1}}),
                }]
            );
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_poll_drops_unrecognized_types() {
    let client = client_returning(json!({
        "ts": 110,
        "updates": [
            {"type": "message_typing_state", "object": {"from_id": 7}},
            {"object": {"no": "type"}},
            {"type": "message_new", "object": {"message": {"from_id": 8, "text": "hi", "id": 2}}}
        ]
    }));

    let outcome = client.poll(&session(100)).await;

    match outcome {
        PollOutcome::Continue { ts, events } => {
            assert_eq!(ts, 110);
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].payload["message"]["from_id"], 8);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_poll_missing_updates_is_empty_batch() {
    let client = client_returning(json!({"ts": "101"}));

    let outcome = client.poll(&session(100)).await;

    assert!(matches!(outcome, PollOutcome::Continue { ts: 101, ref events } if events.is_empty()));
}

#[tokio::test]
async fn test_poll_failed_1_is_soft_expiry() {
    let client = client_returning(json!({"failed": 1, "ts": "106"}));

    let outcome = client.poll(&session(105)).await;

    assert!(matches!(outcome, PollOutcome::SoftExpired { ts: 106 }));
}

#[tokio::test]
async fn test_poll_failed_1_without_ts_keeps_cursor() {
    let client = client_returning(json!({"failed": 1}));

    let outcome = client.poll(&session(105)).await;

    assert!(matches!(outcome, PollOutcome::SoftExpired { ts: 105 }));
}

#[tokio::test]
async fn test_poll_other_failures_are_hard_expiry() {
    for body in [json!({"failed": 2}), json!({"failed": 3}), json!({"failed": "oops"})] {
        let client = client_returning(body);

        let outcome = client.poll(&session(105)).await;

        assert!(matches!(outcome, PollOutcome::HardExpired));
    }
}

#[tokio::test]
async fn test_poll_transport_error() {
    let mut mock_transport = MockHttpTransport::new();
    mock_transport
        .expect_get_json()
        .returning(|_, _| Err(TransportError::Decode("connection reset".to_string())));
    let client = LongPollClient::new(Arc::new(mock_transport), 30, Duration::from_secs(35));

    let outcome = client.poll(&session(105)).await;

    assert!(matches!(outcome, PollOutcome::TransportError(_)));
}

#[tokio::test]
async fn test_poll_missing_ts_is_transport_error() {
    let client = client_returning(json!({"updates": []}));

    let outcome = client.poll(&session(105)).await;

    assert!(matches!(outcome, PollOutcome::TransportError(TransportError::Decode(_))));
}

#[tokio::test]
async fn test_poll_non_array_updates_is_transport_error() {
    let client = client_returning(json!({"ts": "106", "updates": {"type": "message_new"}}));

    let outcome = client.poll(&session(105)).await;

    assert!(matches!(outcome, PollOutcome::TransportError(TransportError::Decode(_))));
}

#[tokio::test]
async fn test_poll_times_out_hung_request() {
    let client = LongPollClient::new(Arc::new(HangingTransport), 30, Duration::from_millis(50));

    let outcome = client.poll(&session(105)).await;

    assert!(matches!(outcome, PollOutcome::TransportError(TransportError::Timeout(_))));
}
