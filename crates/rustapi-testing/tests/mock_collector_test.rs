use http::StatusCode;
use rustapi_testing::{Behavior, MockCollector};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_records_payloads() {
    let collector = MockCollector::start().await.unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .post(collector.base_url())
        .header("x-api-key", "secret")
        .json(&json!({"project_id": "p1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let received = collector.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].method, http::Method::POST);
    assert_eq!(received[0].api_key(), Some("secret"));
    assert_eq!(received[0].json()["project_id"], "p1");
}

#[tokio::test]
async fn test_respond_with_status() {
    let collector = MockCollector::with_behavior(Behavior::Respond(StatusCode::SERVICE_UNAVAILABLE))
        .await
        .unwrap();

    let resp = reqwest::Client::new()
        .post(collector.base_url())
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(collector.hits(), 1);
}

#[tokio::test]
async fn test_stall_records_but_never_answers() {
    let collector = MockCollector::with_behavior(Behavior::Stall).await.unwrap();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let result = client.post(collector.base_url()).body("{}").send().await;
    assert!(result.unwrap_err().is_timeout());
    assert_eq!(collector.hits(), 1);
}

#[tokio::test]
async fn test_wait_for_returns_on_arrival() {
    let collector = MockCollector::start().await.unwrap();
    let url = collector.base_url();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = reqwest::Client::new().post(url).body("{}").send().await;
    });

    let received = collector.wait_for(1, Duration::from_secs(5)).await;
    assert_eq!(received.len(), 1);

    // Gives up once the timeout passes.
    let received = collector.wait_for(2, Duration::from_millis(50)).await;
    assert_eq!(received.len(), 1);
}
