//! Twin request/response plumbing against the mock adapter: get, reported
//! patch, correlation, age-out, cancellation, and error classification.


use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use iothub_device::config::MqttTransportSettings;
use iothub_device::error::ErrorKind;
use iothub_device::protocol::TwinCollection;
use iothub_device::testing::MockMqttClient;
use iothub_device::transport::DeviceTransport;

use test_helpers::{
    device_handler, handler_for, rid_from_topic, sas_credentials, wait_for_publish, wait_until,
};

const TWIN_GET_PREFIX: &str = "$iothub/twin/GET/";
const TWIN_PATCH_PREFIX: &str = "$iothub/twin/PATCH/properties/reported/";

#[tokio::test]
async fn get_twin_returns_desired_and_reported_sections() {
    let mock = MockMqttClient::new();
    let handler = device_handler(&mock);
    let cancel = CancellationToken::new();
    handler.open(&cancel).await.unwrap();

    let twin_task = tokio::spawn({
        let handler = handler.clone();
        let cancel = cancel.clone();
        async move { handler.get_twin(&cancel).await }
    });

    let request_topic = wait_for_publish(&mock, TWIN_GET_PREFIX).await;
    let rid = rid_from_topic(&request_topic);
    mock.inject_publish(
        &format!("$iothub/twin/res/200/?$rid={rid}"),
        br#"{"desired":{"x":1,"$version":3},"reported":{"$version":5}}"#.to_vec(),
    )
    .await;

    let twin = twin_task.await.unwrap().unwrap();
    assert_eq!(twin.desired.get("x"), Some(&json!(1)));
    assert_eq!(twin.desired.version(), Some(3));
    assert_eq!(twin.reported.version(), Some(5));

    // The GET request body is empty and the response subscription was made.
    let get_record = mock
        .published()
        .iter()
        .find(|r| r.topic.starts_with(TWIN_GET_PREFIX))
        .cloned()
        .unwrap();
    assert!(get_record.payload.is_empty());
    assert!(mock
        .subscriptions()
        .contains(&"$iothub/twin/res/#".to_string()));
}

#[tokio::test]
async fn twin_response_subscription_is_established_once_per_session() {
    let mock = MockMqttClient::new();
    let handler = device_handler(&mock);
    let cancel = CancellationToken::new();
    handler.open(&cancel).await.unwrap();

    for _ in 0..2 {
        let twin_task = tokio::spawn({
            let handler = handler.clone();
            let cancel = cancel.clone();
            async move { handler.get_twin(&cancel).await }
        });
        let topic = wait_for_publish(&mock, TWIN_GET_PREFIX).await;
        let rid = rid_from_topic(&topic);
        mock.inject_publish(
            &format!("$iothub/twin/res/200/?$rid={rid}"),
            br#"{"desired":{},"reported":{}}"#.to_vec(),
        )
        .await;
        twin_task.await.unwrap().unwrap();
    }

    let twin_subscribes = mock
        .subscriptions()
        .iter()
        .filter(|t| *t == "$iothub/twin/res/#")
        .count();
    assert_eq!(twin_subscribes, 1);
}

#[tokio::test]
async fn update_reported_returns_the_version_from_the_topic() {
    let mock = MockMqttClient::new();
    let handler = device_handler(&mock);
    let cancel = CancellationToken::new();
    handler.open(&cancel).await.unwrap();

    let patch_task = tokio::spawn({
        let handler = handler.clone();
        let cancel = cancel.clone();
        async move {
            let reported = TwinCollection(json!({"a": "b"}));
            handler.update_reported_properties(&reported, &cancel).await
        }
    });

    let request_topic = wait_for_publish(&mock, TWIN_PATCH_PREFIX).await;
    let rid = rid_from_topic(&request_topic);

    let patch_record = mock
        .published()
        .iter()
        .find(|r| r.topic.starts_with(TWIN_PATCH_PREFIX))
        .cloned()
        .unwrap();
    assert_eq!(patch_record.payload, br#"{"a":"b"}"#.to_vec());

    mock.inject_publish(
        &format!("$iothub/twin/res/204/?$rid={rid}&$version=7"),
        Vec::new(),
    )
    .await;

    assert_eq!(patch_task.await.unwrap().unwrap(), 7);
}

#[tokio::test(start_paused = true)]
async fn unanswered_get_twin_is_failed_by_the_sweeper() {
    let mock = MockMqttClient::new();
    let mut settings = MqttTransportSettings::default();
    settings.twin_response_timeout = Duration::from_secs(60);
    let handler = handler_for(&mock, sas_credentials("d1"), settings);
    let cancel = CancellationToken::new();
    handler.open(&cancel).await.unwrap();

    let twin_task = tokio::spawn({
        let handler = handler.clone();
        let cancel = cancel.clone();
        async move { handler.get_twin(&cancel).await }
    });
    wait_for_publish(&mock, TWIN_GET_PREFIX).await;

    // The service never answers; two sweep periods guarantee the entry's
    // age exceeds the timeout at a tick.
    tokio::time::sleep(Duration::from_secs(121)).await;

    let err = twin_task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkErrors);
    assert_eq!(err.message(), "Did not receive twin response from service.");
}

#[tokio::test]
async fn cancellation_removes_the_entry_even_if_the_response_arrives_later() {
    let mock = MockMqttClient::new();
    let handler = device_handler(&mock);
    let open_cancel = CancellationToken::new();
    handler.open(&open_cancel).await.unwrap();

    let op_cancel = CancellationToken::new();
    let twin_task = tokio::spawn({
        let handler = handler.clone();
        let cancel = op_cancel.clone();
        async move { handler.get_twin(&cancel).await }
    });

    let request_topic = wait_for_publish(&mock, TWIN_GET_PREFIX).await;
    let rid = rid_from_topic(&request_topic);

    op_cancel.cancel();
    let err = twin_task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationCancelled);

    // The late response hits an empty registry and is discarded quietly.
    mock.inject_publish(
        &format!("$iothub/twin/res/200/?$rid={rid}"),
        br#"{"desired":{},"reported":{}}"#.to_vec(),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The handler is still fully operational afterwards.
    let twin_task = tokio::spawn({
        let handler = handler.clone();
        let cancel = open_cancel.clone();
        async move { handler.get_twin(&cancel).await }
    });
    let request_topic = wait_for_publish(&mock, TWIN_GET_PREFIX).await;
    let rid2 = rid_from_topic(&request_topic);
    assert_ne!(rid, rid2);
    mock.inject_publish(
        &format!("$iothub/twin/res/200/?$rid={rid2}"),
        br#"{"desired":{},"reported":{}}"#.to_vec(),
    )
    .await;
    twin_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn disconnect_fails_pending_twin_operations_and_resets_the_subscription() {
    let mock = MockMqttClient::new();
    let handler = device_handler(&mock);
    let cancel = CancellationToken::new();
    handler.open(&cancel).await.unwrap();

    let get_task = tokio::spawn({
        let handler = handler.clone();
        let cancel = cancel.clone();
        async move { handler.get_twin(&cancel).await }
    });
    wait_for_publish(&mock, TWIN_GET_PREFIX).await;

    let patch_task = tokio::spawn({
        let handler = handler.clone();
        let cancel = cancel.clone();
        async move {
            let reported = TwinCollection(json!({"a": 1}));
            handler.update_reported_properties(&reported, &cancel).await
        }
    });
    wait_for_publish(&mock, TWIN_PATCH_PREFIX).await;

    mock.inject_disconnect("broker went away").await;

    // Both awaiters fail immediately with a transient network error.
    let get_err = get_task.await.unwrap().unwrap_err();
    let patch_err = patch_task.await.unwrap().unwrap_err();
    assert_eq!(get_err.kind(), ErrorKind::NetworkErrors);
    assert_eq!(patch_err.kind(), ErrorKind::NetworkErrors);

    // Reopen: the twin response subscription must be re-established.
    handler.open(&cancel).await.unwrap();
    let twin_task = tokio::spawn({
        let handler = handler.clone();
        let cancel = cancel.clone();
        async move { handler.get_twin(&cancel).await }
    });
    let request_topic = wait_for_publish_nth(&mock, TWIN_GET_PREFIX, 2).await;
    let rid = rid_from_topic(&request_topic);
    mock.inject_publish(
        &format!("$iothub/twin/res/200/?$rid={rid}"),
        br#"{"desired":{},"reported":{}}"#.to_vec(),
    )
    .await;
    twin_task.await.unwrap().unwrap();

    let twin_subscribes = mock
        .subscriptions()
        .iter()
        .filter(|t| *t == "$iothub/twin/res/#")
        .count();
    assert_eq!(twin_subscribes, 2);
}

/// Wait for the `n`-th publish (1-based) with the given prefix.
async fn wait_for_publish_nth(mock: &MockMqttClient, prefix: &str, n: usize) -> String {
    wait_until(
        || {
            mock.published()
                .iter()
                .filter(|r| r.topic.starts_with(prefix))
                .count()
                >= n
        },
        "nth publish",
    )
    .await;
    mock.published()
        .iter()
        .filter(|r| r.topic.starts_with(prefix))
        .nth(n - 1)
        .map(|r| r.topic.clone())
        .unwrap()
}

#[tokio::test]
async fn known_error_codes_in_twin_error_bodies_map_to_their_kind() {
    let mock = MockMqttClient::new();
    let handler = device_handler(&mock);
    let cancel = CancellationToken::new();
    handler.open(&cancel).await.unwrap();

    let twin_task = tokio::spawn({
        let handler = handler.clone();
        let cancel = cancel.clone();
        async move { handler.get_twin(&cancel).await }
    });
    let rid = rid_from_topic(&wait_for_publish(&mock, TWIN_GET_PREFIX).await);

    mock.inject_publish(
        &format!("$iothub/twin/res/429/?$rid={rid}"),
        br#"{"ErrorCode":429002,"Message":"Throttling budget exceeded","TrackingId":"t-123"}"#
            .to_vec(),
    )
    .await;

    let err = twin_task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Throttled);
    assert!(err.is_transient());
    assert_eq!(err.tracking_id(), Some("t-123"));
    assert_eq!(err.message(), "Throttling budget exceeded");
}

#[tokio::test]
async fn unparseable_error_bodies_fall_back_to_the_status_code() {
    let mock = MockMqttClient::new();
    let handler = device_handler(&mock);
    let cancel = CancellationToken::new();
    handler.open(&cancel).await.unwrap();

    let twin_task = tokio::spawn({
        let handler = handler.clone();
        let cancel = cancel.clone();
        async move { handler.get_twin(&cancel).await }
    });
    let rid = rid_from_topic(&wait_for_publish(&mock, TWIN_GET_PREFIX).await);

    mock.inject_publish(&format!("$iothub/twin/res/500/?$rid={rid}"), b"garbage".to_vec())
        .await;

    let err = twin_task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServerError);
    assert!(err.message().contains("500"));
}

#[tokio::test]
async fn unknown_status_yields_a_generic_service_error() {
    let mock = MockMqttClient::new();
    let handler = device_handler(&mock);
    let cancel = CancellationToken::new();
    handler.open(&cancel).await.unwrap();

    let twin_task = tokio::spawn({
        let handler = handler.clone();
        let cancel = cancel.clone();
        async move { handler.get_twin(&cancel).await }
    });
    let rid = rid_from_topic(&wait_for_publish(&mock, TWIN_GET_PREFIX).await);

    mock.inject_publish(
        &format!("$iothub/twin/res/418/?$rid={rid}"),
        br#"{"ErrorCode":418000,"Message":"teapot","TrackingId":"t-9"}"#.to_vec(),
    )
    .await;

    let err = twin_task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unknown);
    assert_eq!(err.message(), "teapot");
    assert_eq!(err.tracking_id(), Some("t-9"));
}

#[tokio::test]
async fn undecodable_twin_document_surfaces_the_decode_cause() {
    let mock = MockMqttClient::new();
    let handler = device_handler(&mock);
    let cancel = CancellationToken::new();
    handler.open(&cancel).await.unwrap();

    let twin_task = tokio::spawn({
        let handler = handler.clone();
        let cancel = cancel.clone();
        async move { handler.get_twin(&cancel).await }
    });
    let rid = rid_from_topic(&wait_for_publish(&mock, TWIN_GET_PREFIX).await);

    mock.inject_publish(&format!("$iothub/twin/res/200/?$rid={rid}"), b"{not json".to_vec())
        .await;

    let err = twin_task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unknown);
    assert!(std::error::Error::source(&err).is_some());
}

#[tokio::test]
async fn reported_patch_without_version_is_an_error() {
    let mock = MockMqttClient::new();
    let handler = device_handler(&mock);
    let cancel = CancellationToken::new();
    handler.open(&cancel).await.unwrap();

    let patch_task = tokio::spawn({
        let handler = handler.clone();
        let cancel = cancel.clone();
        async move {
            let reported = TwinCollection(json!({"a": 1}));
            handler.update_reported_properties(&reported, &cancel).await
        }
    });
    let rid = rid_from_topic(&wait_for_publish(&mock, TWIN_PATCH_PREFIX).await);

    // 204 without $version in the query string.
    mock.inject_publish(&format!("$iothub/twin/res/204/?$rid={rid}"), Vec::new())
        .await;

    let err = patch_task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unknown);
}
