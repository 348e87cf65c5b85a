//! Property-based tests for the pure parts of the driver: delayed queue naming, delayed queue
//! arguments, configuration defaults, redial backoff and priority ordering.

mod common;

use std::time::Duration;

use common::strategies::*;
use proptest::prelude::*;
use tasker_amqp::broker::amqp_value_to_i64;
use tasker_amqp::constants::{queue_arguments, DELAYED_QUEUE_PREFIX};
use tasker_amqp::driver::{delayed_queue_name, next_backoff, TopologyManager};
use tasker_amqp::{
    apply_defaults, BoundedPriorityQueue, DriverConfig, Item, Job, PriorityQueue,
};

proptest! {
    #[test]
    fn test_delayed_queue_name_round_trips_its_parts(
        delay_ms in delay_ms_strategy(),
        exchange in entity_name_strategy(),
        queue in entity_name_strategy(),
    ) {
        let name = delayed_queue_name(delay_ms, &exchange, &queue);

        let rest = name
            .strip_prefix(&format!("{DELAYED_QUEUE_PREFIX}-"))
            .expect("prefixed name");
        let mut parts = rest.splitn(3, '.');
        prop_assert_eq!(parts.next().and_then(|ms| ms.parse::<i64>().ok()), Some(delay_ms));
        prop_assert_eq!(parts.next(), Some(exchange.as_str()));
        prop_assert_eq!(parts.next(), Some(queue.as_str()));
    }

    #[test]
    fn test_delayed_queue_expires_after_twice_the_delay(
        delay_ms in delay_ms_strategy(),
        exchange in entity_name_strategy(),
        queue in entity_name_strategy(),
    ) {
        let config = DriverConfig::new()
            .with_exchange(exchange.clone())
            .with_queue(queue.clone())
            .with_routing_key("rk");
        let spec = TopologyManager::from_config(&config).delayed_queue_spec(delay_ms);

        prop_assert_eq!(&spec.name, &delayed_queue_name(delay_ms, &exchange, &queue));
        prop_assert!(spec.durable);
        prop_assert_eq!(
            spec.argument(queue_arguments::MESSAGE_TTL).and_then(amqp_value_to_i64),
            Some(delay_ms)
        );
        prop_assert_eq!(
            spec.argument(queue_arguments::EXPIRES).and_then(amqp_value_to_i64),
            Some(delay_ms * 2)
        );
    }

    #[test]
    fn test_apply_defaults_is_idempotent(
        queue in prop::option::of(entity_name_strategy()),
        prefetch in 0u16..100,
        redial_timeout in 0u64..600,
    ) {
        let config = DriverConfig {
            queue: queue.unwrap_or_default(),
            prefetch,
            redial_timeout,
            ..DriverConfig::default()
        };

        let once = apply_defaults(config);
        let twice = apply_defaults(once.clone());
        prop_assert_eq!(&once, &twice);
        prop_assert!(once.validate().is_ok());
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped(
        ceiling_ms in 0u64..120_000,
        steps in 1usize..40,
    ) {
        let ceiling = Duration::from_millis(ceiling_ms);
        let cap = ceiling.max(Duration::from_millis(50));

        let mut backoff = Duration::from_millis(50);
        for _ in 0..steps {
            let next = next_backoff(backoff, ceiling);
            prop_assert!(next >= backoff.min(cap));
            prop_assert!(next <= cap);
            backoff = next;
        }
    }

    #[test]
    fn test_priority_queue_serves_lowest_priority_first_in_arrival_order(
        priorities in priority_sequence_strategy(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let queue = BoundedPriorityQueue::new(priorities.len());

        runtime.block_on(async {
            for (index, priority) in priorities.iter().enumerate() {
                let job = Job::new("job", Vec::new())
                    .with_id(index.to_string())
                    .with_priority(*priority);
                queue.insert(Item::from_job(job)).await.unwrap();
            }
        });

        let mut extracted = Vec::new();
        while let Some(item) = queue.try_extract() {
            let index: usize = item.id().parse().unwrap();
            extracted.push((item.priority(), index));
        }

        let mut expected: Vec<(i64, usize)> = priorities
            .iter()
            .enumerate()
            .map(|(index, priority)| (*priority, index))
            .collect();
        expected.sort();
        prop_assert_eq!(extracted, expected);
        prop_assert!(queue.is_empty());
    }
}
