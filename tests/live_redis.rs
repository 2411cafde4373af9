//! Redis live channel integration tests using testcontainers.
//!
//! Run with: cargo test --test live_redis -- --ignored --nocapture

use std::time::Duration;

use futures::StreamExt;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

use dashfeed::live::{publish_record, LiveChannel, RedisLive};
use dashfeed::model::Sale;

/// Start Redis container.
async fn start_redis() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start redis container");

    let host_port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let url = format!("redis://{}:{}", host, host_port);
    println!("Redis available at: {}", url);

    (container, url)
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_publish_reaches_subscriber() {
    let (_container, url) = start_redis().await;
    let live = RedisLive::connect(&url).await.expect("Failed to connect");

    let mut stream = live
        .subscribe(&["sales".to_string(), "stock_quotes".to_string()])
        .await
        .unwrap();

    let sale = Sale {
        product_name: "Widget".to_string(),
        revenue: 12.5,
        ..Default::default()
    };
    let receivers = publish_record(&live, "sales", &sale).await.unwrap();
    assert_eq!(receivers, 1);

    let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("Timed out waiting for message")
        .expect("Subscription ended");
    assert_eq!(message.channel, "sales");
    let received: Sale = serde_json::from_str(&message.payload).unwrap();
    assert_eq!(received, sale);
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_publish_without_subscribers() {
    let (_container, url) = start_redis().await;
    let live = RedisLive::connect(&url).await.unwrap();

    assert_eq!(live.publish("user_events", "{}".to_string()).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_dropped_subscription_unsubscribes() {
    let (_container, url) = start_redis().await;
    let live = RedisLive::connect(&url).await.unwrap();

    let stream = live.subscribe(&["financial_metrics".to_string()]).await.unwrap();
    drop(stream);

    // Redis processes the disconnect asynchronously.
    let mut receivers = 1;
    for _ in 0..50 {
        receivers = live
            .publish("financial_metrics", "{}".to_string())
            .await
            .unwrap();
        if receivers == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(receivers, 0);
}
