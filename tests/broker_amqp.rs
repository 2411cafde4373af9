//! RabbitMQ broker integration tests using testcontainers.
//!
//! Run with: cargo test --test broker_amqp -- --ignored --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required, but a Docker daemon is.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

use dashfeed::broker::amqp::{AmqpBroker, AmqpConfig};
use dashfeed::broker::{BrokerError, BrokerQueue, Delivery, DeliveryStream};
use dashfeed::model::Quote;
use dashfeed::persist::MemoryStore;
use dashfeed::topics::TopicTable;
use dashfeed::utils::shutdown;
use dashfeed::worker::IngestionWorker;

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);

    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

fn unique_queue(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

async fn next(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Delivery stream ended")
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_publish_consume_ack() {
    let (_container, url) = start_rabbitmq().await;
    let broker = AmqpBroker::connect(AmqpConfig::new(&url))
        .await
        .expect("Failed to connect");
    let queue = unique_queue("ack");

    broker.declare(&queue).await.unwrap();
    broker.declare(&queue).await.unwrap();
    broker.publish(&queue, b"hello".to_vec()).await.unwrap();

    let mut stream = broker.consume(&queue).await.unwrap();
    let delivery = next(&mut stream).await;
    assert_eq!(delivery.payload, b"hello".to_vec());
    assert!(!delivery.redelivered);
    delivery.handle.ack().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_nack_with_requeue_redelivers() {
    let (_container, url) = start_rabbitmq().await;
    let broker = AmqpBroker::connect(AmqpConfig::new(&url)).await.unwrap();
    let queue = unique_queue("requeue");

    broker.declare(&queue).await.unwrap();
    broker.publish(&queue, b"again".to_vec()).await.unwrap();

    let mut stream = broker.consume(&queue).await.unwrap();
    next(&mut stream).await.handle.nack(true).await.unwrap();

    let redelivery = next(&mut stream).await;
    assert_eq!(redelivery.payload, b"again".to_vec());
    assert!(redelivery.redelivered);
    redelivery.handle.ack().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_second_consumer_rejected() {
    let (_container, url) = start_rabbitmq().await;
    let broker = AmqpBroker::connect(AmqpConfig::new(&url)).await.unwrap();
    let queue = unique_queue("single");
    broker.declare(&queue).await.unwrap();

    let _first = broker.consume(&queue).await.unwrap();
    assert!(matches!(
        broker.consume(&queue).await,
        Err(BrokerError::AlreadyConsuming(_))
    ));
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_worker_ingests_from_rabbitmq() {
    let (_container, url) = start_rabbitmq().await;
    let broker = Arc::new(AmqpBroker::connect(AmqpConfig::new(&url)).await.unwrap());
    let topics = TopicTable {
        quote: unique_queue("quotes"),
        ..Default::default()
    };
    broker.declare(&topics.quote).await.unwrap();

    let store = Arc::new(MemoryStore::<Quote>::new());
    let worker = IngestionWorker::new(&topics, broker.clone(), store.clone());
    let (trigger, signal) = shutdown::channel();
    let task = tokio::spawn(worker.run(signal));

    broker
        .publish(&topics.quote, br#"{"symbol":"AAPL","close":103.0}"#.to_vec())
        .await
        .unwrap();
    broker
        .publish(&topics.quote, b"garbage".to_vec())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while store.len().await < 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Record never persisted");

    trigger.trigger();
    task.await.unwrap().unwrap();

    let stored = store.records().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].symbol, "AAPL");
}
