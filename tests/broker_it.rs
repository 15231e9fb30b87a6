// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use txqueue::{
    client::AmqpClient,
    configs::AmqpConfigs,
    errors::HandlerError,
    handler::{SenderDelivery, WorkerDelivery},
};
use uuid::Uuid;

fn client() -> AmqpClient {
    let configs = AmqpConfigs::from_env().expect("valid environment");
    assert!(configs.url.is_some(), "AMQP_URL must point at a test broker");

    AmqpClient::new(configs)
        .unwrap()
        .with_backoff(Arc::new(|_attempt: u32| 1u64))
}

#[tokio::test]
#[ignore = "needs a RabbitMQ broker at AMQP_URL"]
async fn retried_message_comes_back_with_its_count() -> Result<(), Box<dyn std::error::Error>> {
    let client = client();
    assert!(client.is_attached().await);

    let queue = format!("it-payments-{}", Uuid::new_v4());
    let (tx, mut rx) = mpsc::unbounded_channel::<(u32, Value)>();

    let consumer = client
        .open_consumer(&queue, move |delivery: SenderDelivery| {
            let tx = tx.clone();
            async move {
                let retries = delivery.message().retries();
                let body: Value = delivery.message().json()?;
                let _ = tx.send((retries, body));

                if retries == 0 {
                    delivery.schedule_retry().await?;
                } else {
                    delivery.ack().await?;
                }
                Ok::<(), HandlerError>(())
            }
        })
        .await?;

    let producer = client.open_producer(&queue, None).await?;
    producer.send_to_queue(&json!({"tx": "0xfeed"})).await?;

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
    assert_eq!(first, Some((0, json!({"tx": "0xfeed"}))));

    let second = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await?;
    assert_eq!(second, Some((1, json!({"tx": "0xfeed"}))));

    producer.close().await;
    consumer.shutdown().await?;
    client.close().await;
    Ok(())
}

#[tokio::test]
#[ignore = "needs a RabbitMQ broker at AMQP_URL"]
async fn worker_forwards_results_upstream() -> Result<(), Box<dyn std::error::Error>> {
    let client = client();

    let jobs = format!("it-jobs-{}", Uuid::new_v4());
    let results = format!("it-results-{}", Uuid::new_v4());
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let worker = client
        .open_worker(&jobs, &results, |delivery: WorkerDelivery| async move {
            let job: Value = delivery.message().json()?;
            delivery
                .send_to_sender_queue(&json!({"job": job["id"], "ok": true}))
                .await?;
            delivery.ack().await?;
            Ok::<(), HandlerError>(())
        })
        .await?;

    let sender = client
        .open_consumer(&results, move |delivery: SenderDelivery| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(delivery.message().json::<Value>()?);
                delivery.ack().await?;
                Ok::<(), HandlerError>(())
            }
        })
        .await?;

    let producer = client.open_producer(&jobs, None).await?;
    producer.send_to_queue(&json!({"id": 7})).await?;

    let result = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
    assert_eq!(result, Some(json!({"job": 7, "ok": true})));

    producer.close().await;
    worker.shutdown().await?;
    sender.shutdown().await?;
    client.close().await;
    Ok(())
}
