// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{connect, next, MemoryBroker};
use rabbitmq_client::{
    consumer::{DeliveryHandler, HandlerError, ReactiveHandler},
    dispatcher::{ConsumerState, ReactiveOptions},
    errors::AmqpError,
    marshaller::Payload,
    publisher::PublishOptions,
    queue::QueueOptions,
};
use serde_json::json;
use tokio::sync::mpsc;

#[tokio::test]
async fn subscribe_hands_body_properties_and_envelope_then_acks() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let queue = connection.queue("orders", QueueOptions::new()).await.unwrap();

    let (sender, mut received) = mpsc::unbounded_channel();
    let handle = queue
        .subscribe(DeliveryHandler::on_body_properties_and_envelope(
            move |body, properties, envelope| {
                let sender = sender.clone();
                async move {
                    let _ = sender.send((body, properties.message_id().clone(), envelope));
                    Ok::<(), HandlerError>(())
                }
            },
        ))
        .await
        .unwrap();

    queue.publish(json!({ "order": 1 }), PublishOptions::new()).await.unwrap();

    let (body, message_id, envelope) = next(&mut received).await;
    assert_eq!(body, Payload::from(json!({ "order": 1 })));
    assert!(message_id.is_some());
    assert!(!envelope.redelivered);
    assert_eq!(envelope.exchange, "orders_exchange");

    handle.cancel().await.unwrap();
    assert_eq!(handle.state(), ConsumerState::Cancelled);
    handle.join().await.unwrap();
    assert_eq!(broker.unacked(), 0);
}

#[tokio::test]
async fn failing_handler_stops_the_consumer_and_leaves_the_delivery_unacked() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let queue = connection.queue("orders", QueueOptions::new()).await.unwrap();

    let handle = queue
        .subscribe(DeliveryHandler::on_body(|_| async move {
            Err::<(), HandlerError>(HandlerError::from("cannot handle"))
        }))
        .await
        .unwrap();
    queue.publish("Hello", PublishOptions::new()).await.unwrap();

    let err = handle.join().await.unwrap_err();
    assert_eq!(err, AmqpError::HandlerError("cannot handle".to_owned()));
    assert_eq!(broker.unacked(), 1);
}

#[tokio::test]
async fn loop_subscribe_processes_in_order_until_aborted() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let queue = connection.queue("numbers", QueueOptions::new()).await.unwrap();

    for n in 1..=3 {
        queue.publish(json!(n), PublishOptions::new()).await.unwrap();
    }

    let (sender, mut received) = mpsc::unbounded_channel();
    let consumer = queue.clone();
    let task = tokio::spawn(async move {
        consumer
            .loop_subscribe(DeliveryHandler::on_body_and_properties(move |body, _| {
                let sender = sender.clone();
                async move {
                    let _ = sender.send(body);
                    Ok::<(), HandlerError>(())
                }
            }))
            .await
    });

    for n in 1..=3 {
        assert_eq!(next(&mut received).await, Payload::from(json!(n)));
    }

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert_eq!(broker.ready("numbers"), 0);
}

#[tokio::test]
async fn reactive_reject_with_requeue_redelivers() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let queue = connection.queue("jobs", QueueOptions::new()).await.unwrap();
    queue.publish("job", PublishOptions::new()).await.unwrap();

    let (sender, mut received) = mpsc::unbounded_channel();
    let consumer = queue.clone();
    let task = tokio::spawn(async move {
        consumer
            .reactive_loop_subscribe(
                ReactiveHandler::new(move |message| {
                    let sender = sender.clone();
                    async move {
                        let _ = sender.send(message.redelivered());
                        if !message.redelivered() {
                            message.reject(true).await?;
                            message.ack().await?;
                        }
                        Ok::<(), HandlerError>(())
                    }
                }),
                ReactiveOptions::new(),
            )
            .await
    });

    assert!(!next(&mut received).await);
    assert!(next(&mut received).await);

    task.abort();
    let _ = task.await;
    assert_eq!(broker.unacked(), 0);
    assert_eq!(broker.ready("jobs"), 0);
}

#[tokio::test]
async fn disconnect_ends_standing_consumers() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let queue = connection.queue("orders", QueueOptions::new()).await.unwrap();

    let handle = queue
        .subscribe(DeliveryHandler::on_body(|_| async move {
            Ok::<(), HandlerError>(())
        }))
        .await
        .unwrap();

    connection.disconnect().await.unwrap();

    handle.join().await.unwrap();
    assert!(broker.bindings_of("orders").is_empty());
}
