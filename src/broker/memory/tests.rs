use super::*;
use std::time::Duration;

async fn next(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Stream ended")
}

#[tokio::test]
async fn test_declare_is_idempotent() {
    let broker = MemoryBroker::new();
    broker.declare("sales").await.unwrap();
    broker.publish("sales", b"one".to_vec()).await.unwrap();
    broker.declare("sales").await.unwrap();

    assert_eq!(broker.stats("sales").await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_publish_unknown_queue() {
    let broker = MemoryBroker::new();
    let result = broker.publish("nowhere", vec![]).await;
    assert!(matches!(result, Err(BrokerError::UnknownQueue(_))));
}

#[tokio::test]
async fn test_publish_failure_has_no_effect() {
    let broker = MemoryBroker::new();
    broker.declare("sales").await.unwrap();
    broker.set_fail_on_publish(true);

    assert!(broker.publish("sales", b"x".to_vec()).await.is_err());
    assert_eq!(broker.stats("sales").await.unwrap(), QueueStats::default());
}

#[tokio::test]
async fn test_consume_in_publish_order() {
    let broker = MemoryBroker::new();
    broker.declare("q").await.unwrap();
    for i in 0..3u8 {
        broker.publish("q", vec![i]).await.unwrap();
    }

    let mut stream = broker.consume("q").await.unwrap();
    for i in 0..3u8 {
        let delivery = next(&mut stream).await;
        assert_eq!(delivery.payload, vec![i]);
        assert!(!delivery.redelivered);
        delivery.handle.ack().await.unwrap();
    }

    let stats = broker.stats("q").await.unwrap();
    assert_eq!(stats.acked, 3);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_consumer_waits_for_publish() {
    let broker = Arc::new(MemoryBroker::new());
    broker.declare("q").await.unwrap();
    let mut stream = broker.consume("q").await.unwrap();

    let publisher = Arc::clone(&broker);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.publish("q", b"late".to_vec()).await.unwrap();
    });

    assert_eq!(next(&mut stream).await.payload, b"late".to_vec());
}

#[tokio::test]
async fn test_nack_requeue_redelivers() {
    let broker = MemoryBroker::new();
    broker.declare("q").await.unwrap();
    broker.publish("q", b"retry".to_vec()).await.unwrap();

    let mut stream = broker.consume("q").await.unwrap();
    next(&mut stream).await.handle.nack(true).await.unwrap();

    let again = next(&mut stream).await;
    assert_eq!(again.payload, b"retry".to_vec());
    assert!(again.redelivered);
    again.handle.ack().await.unwrap();

    let stats = broker.stats("q").await.unwrap();
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.acked, 1);
}

#[tokio::test]
async fn test_nack_without_requeue_drops() {
    let broker = MemoryBroker::new();
    broker.declare("q").await.unwrap();
    broker.publish("q", b"bad".to_vec()).await.unwrap();

    let mut stream = broker.consume("q").await.unwrap();
    next(&mut stream).await.handle.nack(false).await.unwrap();

    let stats = broker.stats("q").await.unwrap();
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_dropped_handle_is_redelivered() {
    let broker = MemoryBroker::new();
    broker.declare("q").await.unwrap();
    broker.publish("q", b"crash".to_vec()).await.unwrap();

    let mut stream = broker.consume("q").await.unwrap();
    drop(next(&mut stream).await);

    let again = next(&mut stream).await;
    assert!(again.redelivered);
    again.handle.ack().await.unwrap();
}

#[tokio::test]
async fn test_single_consumer_per_queue() {
    let broker = MemoryBroker::new();
    broker.declare("q").await.unwrap();

    let first = broker.consume("q").await.unwrap();
    assert!(matches!(
        broker.consume("q").await,
        Err(BrokerError::AlreadyConsuming(_))
    ));

    drop(first);
    assert!(broker.consume("q").await.is_ok());
}

#[tokio::test]
async fn test_messages_survive_consumer_restart() {
    let broker = MemoryBroker::new();
    broker.declare("q").await.unwrap();
    broker.publish("q", b"durable".to_vec()).await.unwrap();

    drop(broker.consume("q").await.unwrap());

    let mut stream = broker.consume("q").await.unwrap();
    assert_eq!(next(&mut stream).await.payload, b"durable".to_vec());
}
