use super::*;

#[test]
fn test_new_transport() {
    let transport = ReqwestTransport::new(Duration::from_secs(35));
    assert!(transport.is_ok());
}

#[test]
fn test_method_url_joins_base() {
    let url = method_url("https://api.vk.com/method/", "groups.getLongPollServer").unwrap();
    assert_eq!(url, "https://api.vk.com/method/groups.getLongPollServer");
}

#[test]
fn test_method_url_without_trailing_slash_replaces_last_segment() {
    let url = method_url("https://api.vk.com/method", "messages.send").unwrap();
    assert_eq!(url, "https://api.vk.com/messages.send");
}

#[test]
fn test_method_url_invalid_base() {
    let result = method_url("not a url", "messages.send");
    assert!(matches!(result, Err(TransportError::InvalidUrl(_))));
}

#[tokio::test]
async fn test_get_json_rejects_invalid_url() {
    let transport = ReqwestTransport::new(Duration::from_secs(1)).unwrap();

    let result = transport.get_json("lp.vk.com/wh1", &[]).await;

    assert!(matches!(result, Err(TransportError::InvalidUrl(_))));
}

#[test]
fn test_server_errors_and_timeouts_are_transient() {
    assert!(TransportError::Status(StatusCode::BAD_GATEWAY).is_transient());
    assert!(TransportError::Status(StatusCode::TOO_MANY_REQUESTS).is_transient());
    assert!(TransportError::Timeout(Duration::from_secs(35)).is_transient());
}

#[test]
fn test_client_errors_are_not_transient() {
    assert!(!TransportError::Status(StatusCode::FORBIDDEN).is_transient());
    assert!(!TransportError::Status(StatusCode::NOT_FOUND).is_transient());
    assert!(!TransportError::Decode("missing ts".to_string()).is_transient());
}
