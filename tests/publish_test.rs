// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{connect, MemoryBroker};
use lapin::{types::ShortString, BasicProperties};
use parking_lot::Mutex;
use rabbitmq_client::{
    errors::AmqpError,
    exchange::ExchangeOptions,
    marshaller::{MarshallerSelector, Payload},
    publisher::{PublishFeedback, PublishOptions},
    queue::{QueueOptions, RetrieveOptions},
    transport::ReturnedMessage,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};

#[tokio::test]
async fn purge_empties_the_queue() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let queue = connection.queue("test_queue", QueueOptions::new()).await.unwrap();

    for n in 0..3 {
        queue.publish(json!({ "n": n }), PublishOptions::new()).await.unwrap();
    }
    assert_eq!(broker.ready("test_queue"), 3);

    assert_eq!(queue.purge().await.unwrap(), 3);
    assert!(queue.retrieve(RetrieveOptions::new()).await.unwrap().is_none());
}

#[tokio::test]
async fn retrieve_decodes_with_queue_marshaller_and_keeps_properties() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let queue = connection.queue("test_queue", QueueOptions::new()).await.unwrap();

    let outcome = queue
        .publish(
            json!({ "order": 42, "city": "人大" }),
            PublishOptions::new()
                .properties(BasicProperties::default().with_app_id(ShortString::from("billing"))),
        )
        .await
        .unwrap();
    assert_eq!(outcome.body, Payload::from(json!({ "order": 42, "city": "人大" })));
    assert!(outcome.feedback.is_none());

    let retrieved = queue
        .retrieve(RetrieveOptions::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(retrieved.body, Payload::from(json!({ "order": 42, "city": "人大" })));
    assert_eq!(retrieved.properties.app_id(), &Some(ShortString::from("billing")));
    assert!(retrieved.properties.message_id().is_some());
    assert_eq!(retrieved.envelope.exchange, "test_queue_exchange");
    assert_eq!(broker.unacked(), 0);
}

#[tokio::test]
async fn retrieve_without_ack_leaves_nothing_pending() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let queue = connection
        .queue("raw", QueueOptions::new().marshaller(MarshallerSelector::Disable))
        .await
        .unwrap();

    queue.publish(b"\x00\x01".to_vec(), PublishOptions::new()).await.unwrap();
    let retrieved = queue
        .retrieve(RetrieveOptions::new().no_ack())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(retrieved.body, Payload::Bytes(vec![0, 1]));
    assert_eq!(broker.unacked(), 0);
}

#[tokio::test]
async fn topic_exchange_routes_by_pattern() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let exchange = connection.topic("orders", ExchangeOptions::new()).await.unwrap();
    let eu = connection.queue("orders.eu", QueueOptions::new()).await.unwrap();
    let urgent = connection.queue("orders.urgent", QueueOptions::new()).await.unwrap();
    eu.bind(&exchange, "orders.*.eu").await.unwrap();
    urgent.bind(&exchange, "#.urgent").await.unwrap();

    exchange.publish("a", "orders.created.eu", PublishOptions::new()).await.unwrap();
    exchange.publish("b", "orders.created.eu.urgent", PublishOptions::new()).await.unwrap();
    exchange.publish("c", "urgent", PublishOptions::new()).await.unwrap();

    assert_eq!(broker.ready("orders.eu"), 1);
    assert_eq!(broker.ready("orders.urgent"), 2);
}

#[tokio::test]
async fn persistent_publish_needs_durable_entities() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;

    let transient = connection.direct("transient", ExchangeOptions::new()).await.unwrap();
    let err = transient
        .persistent_publish("Hello", "", PublishOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AmqpError::PersistenceMismatchError(_)));

    let queue = connection.queue("durable_queue", QueueOptions::new().durable()).await.unwrap();
    queue.persistent_publish("Hello", PublishOptions::new()).await.unwrap();

    let retrieved = queue.retrieve(RetrieveOptions::new()).await.unwrap().unwrap();
    assert_eq!(retrieved.properties.delivery_mode(), &Some(2));
}

#[tokio::test]
async fn unroutable_mandatory_publish_reports_the_return() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let exchange = connection.direct("direct_exchange", ExchangeOptions::new()).await.unwrap();

    let returned = Arc::new(Mutex::new(Vec::<ReturnedMessage>::new()));
    let sink = returned.clone();
    connection
        .on_return(Some(Arc::new(move |message: ReturnedMessage| sink.lock().push(message))))
        .unwrap();

    let outcome = exchange
        .publish(
            "Hello",
            "nowhere",
            PublishOptions::new().mandatory().listen_for_returns(),
        )
        .await
        .unwrap();

    match outcome.feedback {
        Some(PublishFeedback::Return(message)) => {
            assert_eq!(message.reply_code, 312);
            assert_eq!(message.routing_key, "nowhere");
        }
        other => panic!("unexpected feedback {other:?}"),
    }
    assert!(returned.lock().is_empty());

    exchange
        .publish("Hello", "nowhere", PublishOptions::new().mandatory())
        .await
        .unwrap();
    assert_eq!(returned.lock().len(), 1);
}

#[tokio::test]
async fn abandoned_feedback_publish_gives_returns_back_to_the_application() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let queue = connection.queue("test_queue", QueueOptions::new()).await.unwrap();
    let exchange = connection.direct("direct_exchange", ExchangeOptions::new()).await.unwrap();

    let returned = Arc::new(Mutex::new(0usize));
    let counter = returned.clone();
    connection
        .on_return(Some(Arc::new(move |_: ReturnedMessage| *counter.lock() += 1)))
        .unwrap();

    let waiting = queue.publish(
        "Hello",
        PublishOptions::new()
            .mandatory()
            .listen_for_returns()
            .feedback_timeout(Duration::from_secs(5)),
    );
    assert!(tokio::time::timeout(Duration::from_millis(5), waiting)
        .await
        .is_err());

    exchange
        .publish("Hello", "nowhere", PublishOptions::new().mandatory())
        .await
        .unwrap();
    assert_eq!(*returned.lock(), 1);
}

#[tokio::test]
async fn routable_publish_times_out_waiting_for_a_return() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let queue = connection.queue("test_queue", QueueOptions::new()).await.unwrap();

    let outcome = queue
        .publish("Hello", PublishOptions::new().mandatory().listen_for_returns())
        .await
        .unwrap();

    assert_eq!(outcome.feedback, Some(PublishFeedback::TimeOut));
    assert_eq!(broker.ready("test_queue"), 1);
}

#[tokio::test]
async fn confirm_mode_acknowledges_publishes() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    connection.enable_confirms().await.unwrap();
    let exchange = connection.fanout("fanout_exchange", ExchangeOptions::new()).await.unwrap();

    let first = exchange
        .publish("one", "", PublishOptions::new().listen_for_confirms())
        .await
        .unwrap();
    let second = exchange
        .publish("two", "", PublishOptions::new().listen_for_confirms())
        .await
        .unwrap();

    assert_eq!(
        first.feedback,
        Some(PublishFeedback::Ack {
            delivery_tag: 1,
            multiple: false
        })
    );
    assert_eq!(
        second.feedback,
        Some(PublishFeedback::Ack {
            delivery_tag: 2,
            multiple: false
        })
    );
}

#[tokio::test]
async fn json_marshaller_refuses_raw_bytes_before_publishing() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let queue = connection.queue("test_queue", QueueOptions::new()).await.unwrap();

    let err = queue
        .publish(vec![0xffu8, 0x00], PublishOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AmqpError::NotEncodableError(_)));
    assert_eq!(broker.ready("test_queue"), 0);
}
