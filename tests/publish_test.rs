//! Publish path: immediate routing, delayed routing through the dead-letter pattern, counter
//! rollback, codec selection and exclusive use of the publish channel.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::builders::*;
use tasker_amqp::broker::memory::Operation;
use tasker_amqp::broker::{amqp_value_to_i64, amqp_value_to_string};
use tasker_amqp::constants::{headers, queue_arguments, CONTENT_TYPE};
use tasker_amqp::{DriverError, Job};
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_immediate_push_publishes_once_to_exchange() {
    let harness = HarnessBuilder::new().build().await;
    harness.broker.clear_journal();

    assert_ok!(
        harness
            .consumer
            .push(job("a"), &CancellationToken::new())
            .await
    );

    let publishes = harness.broker.publishes();
    assert_eq!(publishes.len(), 1);
    let publishing = &publishes[0];
    assert_eq!(publishing.exchange, EXCHANGE);
    assert_eq!(publishing.routing_key, ROUTING_KEY);
    assert_eq!(publishing.content_type, CONTENT_TYPE);
    assert!(publishing.persistent);
    assert_eq!(
        publishing
            .headers
            .inner()
            .get(headers::JOB_ID)
            .and_then(amqp_value_to_string),
        Some("a".to_string())
    );
    assert_eq!(harness.consumer.delayed(), 0);
    assert_eq!(harness.broker.queue_depth(QUEUE), Some(1));

    harness.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_delayed_push_declares_dead_letter_queue() {
    let harness = HarnessBuilder::new().build().await;
    harness.broker.clear_journal();

    let delayed = job("b").with_delay(Duration::from_secs(5));
    assert_ok!(harness.consumer.push(delayed, &CancellationToken::new()).await);

    let declared = harness
        .broker
        .queue_declares()
        .into_iter()
        .find(|spec| spec.name == "delayed-5000.ex.q")
        .expect("delayed queue declared");
    assert_eq!(
        declared
            .argument(queue_arguments::MESSAGE_TTL)
            .and_then(amqp_value_to_i64),
        Some(5000)
    );
    assert_eq!(
        declared
            .argument(queue_arguments::EXPIRES)
            .and_then(amqp_value_to_i64),
        Some(10000)
    );
    assert_eq!(
        declared
            .argument(queue_arguments::DEAD_LETTER_EXCHANGE)
            .and_then(amqp_value_to_string),
        Some(EXCHANGE.to_string())
    );
    assert_eq!(
        declared
            .argument(queue_arguments::DEAD_LETTER_ROUTING_KEY)
            .and_then(amqp_value_to_string),
        Some(ROUTING_KEY.to_string())
    );

    let publishes = harness.broker.publishes();
    assert_eq!(publishes.len(), 1);
    assert_eq!(publishes[0].exchange, EXCHANGE);
    assert_eq!(publishes[0].routing_key, "delayed-5000.ex.q");
    assert_eq!(harness.consumer.delayed(), 1);
    assert_eq!(harness.broker.queue_depth(QUEUE), Some(0));

    harness.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_delayed_queue_is_redeclared_on_every_push() {
    let harness = HarnessBuilder::new().build().await;
    harness.broker.clear_journal();

    for id in ["c1", "c2"] {
        let delayed = job(id).with_delay(Duration::from_millis(2000));
        assert_ok!(harness.consumer.push(delayed, &CancellationToken::new()).await);
    }

    let declares = harness
        .broker
        .queue_declares()
        .into_iter()
        .filter(|spec| spec.name == "delayed-2000.ex.q")
        .count();
    assert_eq!(declares, 2);
    assert_eq!(harness.consumer.delayed(), 2);

    harness.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_delayed_push_rolls_back_counter() {
    let harness = HarnessBuilder::new().build().await;

    harness.broker.fail_next(Operation::QueueDeclare);
    let delayed = job("d").with_delay(Duration::from_secs(1));
    let error = assert_err!(harness.consumer.push(delayed, &CancellationToken::new()).await);
    assert!(matches!(error, DriverError::Topology { .. }));
    assert_eq!(harness.consumer.delayed(), 0);

    harness.broker.fail_next(Operation::Publish);
    let delayed = job("e").with_delay(Duration::from_secs(1));
    let error = assert_err!(harness.consumer.push(delayed, &CancellationToken::new()).await);
    assert!(matches!(error, DriverError::Publish { .. }));
    assert_eq!(harness.consumer.delayed(), 0);

    harness.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_delayed_job_arrives_after_ttl() {
    let harness = HarnessBuilder::new().build().await;
    harness.run().await;

    let delayed = job("f")
        .with_priority(3)
        .with_header("tenant", "acme")
        .with_delay(Duration::from_millis(50));
    assert_ok!(harness.consumer.push(delayed, &CancellationToken::new()).await);
    assert!(harness.queue.is_empty());

    let item = harness
        .extract_within(Duration::from_secs(2))
        .await
        .expect("delayed job delivered");
    assert_eq!(item.id(), "f");
    assert_eq!(item.priority(), 3);
    assert_eq!(item.pipeline(), PIPELINE);
    assert_eq!(item.headers()["tenant"], vec!["acme"]);
    assert_ok!(item.ack().await);

    harness.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_plain_publish_sends_only_user_headers() {
    let harness = HarnessBuilder::new()
        .with_config(|config| config.with_publish_plain(true))
        .build()
        .await;
    harness.run().await;

    let plain = job("g").with_header("tenant", "acme");
    assert_ok!(harness.consumer.push(plain, &CancellationToken::new()).await);

    let publishes = harness.broker.publishes();
    let table = publishes[0].headers.inner();
    assert!(table.get(headers::JOB_ID).is_none());
    assert!(table.get("tenant").is_some());
    assert_eq!(publishes[0].body, b"payload-g".to_vec());

    let item = harness
        .extract_within(Duration::from_secs(1))
        .await
        .expect("plain job delivered");
    assert_ne!(item.id(), "g");
    assert_eq!(item.name(), "auto");
    assert_eq!(item.pipeline(), PIPELINE);
    assert_eq!(item.priority(), 5);
    assert_eq!(item.headers()["tenant"], vec!["acme"]);
    assert_eq!(item.body(), b"payload-g");

    harness.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_push_to_other_pipeline_has_no_side_effect() {
    let harness = HarnessBuilder::new().build().await;
    harness.broker.clear_journal();

    let foreign = Job::new("send_email", Vec::new()).with_pipeline("reports");
    let error = assert_err!(harness.consumer.push(foreign, &CancellationToken::new()).await);

    assert_eq!(error, DriverError::pipeline_mismatch("reports", PIPELINE));
    assert!(harness.broker.journal().is_empty());
    assert_eq!(harness.consumer.delayed(), 0);

    harness.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_push_fails_with_timeout() {
    let harness = HarnessBuilder::new().build().await;
    harness.broker.clear_journal();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let error = assert_err!(harness.consumer.push(job("h"), &cancel).await);

    assert!(error.is_timeout());
    assert!(harness.broker.journal().is_empty());

    harness.consumer.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pushes_never_share_the_publish_channel() {
    let harness = Arc::new(HarnessBuilder::new().build().await);
    harness.broker.clear_journal();

    let mut pushes = Vec::new();
    for index in 0..50 {
        let harness = Arc::clone(&harness);
        pushes.push(tokio::spawn(async move {
            let mut pending = job(&format!("job-{index}"));
            if index % 5 == 0 {
                pending = pending.with_delay(Duration::from_secs(30));
            }
            harness.consumer.push(pending, &CancellationToken::new()).await
        }));
    }
    for push in pushes {
        assert_ok!(push.await.unwrap());
    }

    assert_eq!(harness.broker.concurrent_use_violations(), 0);
    assert_eq!(harness.broker.publishes().len(), 50);
    assert_eq!(harness.consumer.delayed(), 10);
    assert_eq!(harness.broker.queue_depth(QUEUE), Some(40));

    harness.consumer.stop().await.unwrap();
}
