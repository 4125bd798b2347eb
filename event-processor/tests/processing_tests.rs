mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{wait_for, TestService};
use event_processor::cache::MAX_RECENT_EVENTS;
use event_processor::fault::FailureInjectionPolicy;
use event_processor::stream::memory::{json_record, raw_record};
use event_processor::supervisor::SupervisorError;
use serde_json::json;

#[tokio::test]
async fn duplicate_order_created_keeps_one_document() {
    let service = TestService::new();
    service.stream.push_batch(vec![
        json_record(0, 0, "OrderCreated", json!({"OrderId": "O1", "CustomerId": "C1"})),
        json_record(0, 1, "OrderCreated", json!({"OrderId": "O1", "CustomerId": "C1"})),
    ]);

    service.run_until_drained().await;

    assert_eq!(service.documents.ids(), vec!["OrderCreated_O1"]);
    assert_eq!(service.documents.upserts(), 2);
    assert_eq!(service.notifier.sent().len(), 2);
    assert_eq!(service.stream.checkpoints().len(), 1);
    assert_eq!(service.stream.committed_offsets(), HashMap::from([(0, 1)]));

    let document = service.documents.get("OrderCreated_O1").unwrap();
    assert_eq!(document.event_type, "OrderCreated");
    assert_eq!(document.event_data["CustomerId"], "C1");
}

#[tokio::test]
async fn same_order_on_two_partitions_keeps_one_document() {
    let service = TestService::new();
    service.documents.conflict_once("OrderCreated_O7");
    service.stream.push_batch(vec![
        json_record(0, 0, "OrderCreated", json!({"OrderId": "O7", "CustomerId": "C1"})),
        json_record(1, 0, "OrderCreated", json!({"OrderId": "O7", "CustomerId": "C1"})),
    ]);

    service.run_until_drained().await;

    assert_eq!(service.documents.ids(), vec!["OrderCreated_O7"]);
    assert_eq!(
        service.stream.committed_offsets(),
        HashMap::from([(0, 0), (1, 0)])
    );
}

#[tokio::test]
async fn malformed_payload_does_not_block_the_batch() {
    let service = TestService::new();
    service.stream.push_batch(vec![
        json_record(0, 0, "OrderCreated", json!({"OrderId": "O1", "CustomerId": "C1"})),
        raw_record(0, 1, "OrderCreated", b"{\"OrderId\": \"O2\""),
        json_record(0, 2, "OrderStatusUpdated", json!({"OrderId": "O1", "Status": "shipped"})),
    ]);

    service.run_until_drained().await;

    assert_eq!(
        service.documents.ids(),
        vec!["OrderCreated_O1", "OrderStatusUpdated_O1"]
    );
    assert_eq!(service.stream.committed_offsets(), HashMap::from([(0, 2)]));
}

#[tokio::test]
async fn unknown_event_type_goes_to_generic_handler() {
    let service = TestService::new();
    service
        .stream
        .push_batch(vec![json_record(0, 0, "Unknown", json!({"foo": 1, "bar": 2}))]);

    service.run_until_drained().await;

    assert!(service.notifier.sent().is_empty());
    let ids = service.documents.ids();
    assert_eq!(ids.len(), 1);
    assert!(ids[0].starts_with("Unknown_payload-"));

    let recent = service.cache.recent("Unknown").await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].event_type, "Unknown");
    assert_eq!(recent[0].data, *json!({"foo": 1, "bar": 2}).as_object().unwrap());
}

#[tokio::test]
async fn recent_activity_is_bounded() {
    let service = TestService::new();
    let total = MAX_RECENT_EVENTS + 20;
    service.stream.push_batch(
        (0..total)
            .map(|i| {
                json_record(
                    (i % 3) as i32,
                    i as i64,
                    "OrderStatusUpdated",
                    json!({"OrderId": format!("O{i}"), "Status": "packed"}),
                )
            })
            .collect(),
    );

    service.run_until_drained().await;

    assert_eq!(service.documents.len(), total);
    assert_eq!(
        service.lists.len("recent_events:OrderStatusUpdated"),
        MAX_RECENT_EVENTS
    );
    assert_eq!(
        service.cache.recent("OrderStatusUpdated").await.unwrap().len(),
        MAX_RECENT_EVENTS
    );
}

#[tokio::test]
async fn checkpoints_follow_delivery_order_across_batches() {
    let service = TestService::new();
    for offset in 0..25 {
        service.stream.push_batch(vec![json_record(
            0,
            offset,
            "OrderStatusUpdated",
            json!({"OrderId": "O1", "Status": "packed"}),
        )]);
    }

    service.run_until_drained().await;

    let offsets: Vec<i64> = service
        .stream
        .checkpoints()
        .iter()
        .map(|cursor| cursor.offset)
        .collect();
    assert_eq!(offsets, (0..25).collect::<Vec<_>>());
}

#[tokio::test]
async fn disabled_policy_never_injects() {
    let service = TestService::with_policy(FailureInjectionPolicy {
        enabled: false,
        latency_probability: 1.0,
        error_probability: 1.0,
    });
    service.stream.push_batch(
        (0..30)
            .map(|i| json_record(0, i, "OrderCreated", json!({"OrderId": format!("O{i}"), "CustomerId": "C1"})))
            .collect(),
    );

    service.run_until_drained().await;

    assert_eq!(service.documents.len(), 30);
    assert_eq!(service.notifier.sent().len(), 30);
}

#[tokio::test]
async fn injected_errors_fail_events_but_checkpoints_advance() {
    let service = TestService::with_policy(FailureInjectionPolicy {
        enabled: true,
        latency_probability: 0.0,
        error_probability: 1.0,
    });
    service.stream.push_batch(vec![
        json_record(0, 0, "OrderCreated", json!({"OrderId": "O1", "CustomerId": "C1"})),
        json_record(1, 3, "OrderCreated", json!({"OrderId": "O2", "CustomerId": "C2"})),
    ]);

    service.run_until_drained().await;

    assert!(service.documents.is_empty());
    assert!(service.notifier.sent().is_empty());
    assert_eq!(
        service.stream.committed_offsets(),
        HashMap::from([(0, 0), (1, 3)])
    );
}

#[tokio::test]
async fn supervisor_processes_until_stopped() {
    let service = TestService::new();
    let supervisor = service.supervisor(Duration::from_secs(5));

    supervisor.start().await.unwrap();
    assert_eq!(supervisor.start().await, Err(SupervisorError::AlreadyRunning));
    assert!(supervisor.status().running);

    service.stream.push_batch(vec![json_record(
        2,
        9,
        "OrderCreated",
        json!({"OrderId": "O1", "CustomerId": "C1"}),
    )]);
    assert!(wait_for(|| service.stream.committed_offsets().get(&2) == Some(&9)).await);
    assert!(service.documents.get("OrderCreated_O1").is_some());

    assert!(supervisor.stop().await);
    assert!(!supervisor.status().running);

    // Nothing is consumed while stopped
    service.stream.push_batch(vec![json_record(
        2,
        10,
        "OrderCreated",
        json!({"OrderId": "O2", "CustomerId": "C1"}),
    )]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(service.stream.pending(), 1);
    assert!(!supervisor.stop().await);
}
