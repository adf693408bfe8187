//! REST API client against a mock HTTP server.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use notification_client::{
    Anonymous, HttpNotificationApi, Identity, NotificationApi, NotifyError, StaticToken,
};

fn api(server: &MockServer) -> HttpNotificationApi {
    HttpNotificationApi::new(
        format!("{}/v1/notifications", server.uri()),
        Arc::new(StaticToken::new("tok-123")),
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn test_list_customer_notifications() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/notifications/getAllByUserId"))
        .and(header("Authorization", "Bearer tok-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "id": "old",
                "userId": "u1",
                "title": "Welcome",
                "message": "Thanks for joining",
                "isRead": true,
                "creationTimestamp": "2024-05-01T08:00:00"
            },
            { "title": "missing id" },
            {
                "id": 7,
                "userId": "u1",
                "orderId": 99,
                "title": "Order shipped",
                "message": "On its way",
                "type": "ORDER_STATUS",
                "isRead": false,
                "creationTimestamp": "2024-05-01T09:30:00"
            }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let records = api(&server).list(&Identity::customer("u1")).await.unwrap();

    let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["7", "old"]);
    assert_eq!(records[0].payload.order_id.as_deref(), Some("99"));
    assert!(!records[0].is_read);
    assert!(records[1].is_read);
}

#[tokio::test]
async fn test_list_shop_notifications_uses_shop_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/notifications/getAllByShopId"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let records = api(&server).list(&Identity::shop("s1")).await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_mutating_endpoints() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/notifications/markAsRead/n%201"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/notifications/markAllAsReadByShopId"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/notifications/delete/n2"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/notifications/deleteAllByUserId"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let api = api(&server);
    let customer = Identity::customer("u1");
    api.mark_read(&customer, "n 1").await.unwrap();
    api.mark_all_read(&Identity::shop("s1")).await.unwrap();
    api.delete(&customer, "n2").await.unwrap();
    api.delete_all(&customer).await.unwrap();
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/notifications/delete/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Notification not found"))
        .mount(&server)
        .await;

    let err = api(&server)
        .delete(&Identity::customer("u1"), "missing")
        .await
        .unwrap_err();
    match err {
        NotifyError::Api { status, message } => {
            assert_eq!(status, 404);
            assert_eq!(message, "Notification not found");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_anonymous_requests_carry_no_authorization() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/notifications/getAllByUserId"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let api = HttpNotificationApi::new(
        format!("{}/v1/notifications/", server.uri()),
        Arc::new(Anonymous),
        Duration::from_secs(5),
    )
    .unwrap();
    api.list(&Identity::customer("u1")).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].headers.contains_key("authorization"));
}

#[tokio::test]
async fn test_request_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let api = HttpNotificationApi::new(
        format!("{}/v1/notifications", server.uri()),
        Arc::new(Anonymous),
        Duration::from_millis(200),
    )
    .unwrap();
    let err = api.list(&Identity::customer("u1")).await.unwrap_err();
    assert!(matches!(err, NotifyError::Http(_)));
}

#[tokio::test]
async fn test_malformed_list_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/notifications/getAllByShopId"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[{\"id\":"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/notifications/getAllByUserId"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let api = api(&server);
    let err = api.list(&Identity::shop("s1")).await.unwrap_err();
    assert!(matches!(err, NotifyError::Json(_)));

    // An empty body is an empty list
    assert!(api.list(&Identity::customer("u1")).await.unwrap().is_empty());
}
