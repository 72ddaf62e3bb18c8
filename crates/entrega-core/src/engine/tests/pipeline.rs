use super::*;

use std::sync::atomic::Ordering;

use crate::processor::{DispositionAction, DispositionReason};

#[tokio::test]
async fn accepted_payload_is_acked_and_recorded() {
    let setup = pipeline_setup(200).await;
    let snapshot = snapshot_for("orders", &setup.webhook_url);

    let disposition = setup
        .processor
        .process_message(&delivery(1, br#"{"id":1}"#), &snapshot)
        .await;

    assert_eq!(disposition.action, DispositionAction::Ack);
    assert_eq!(disposition.reason, DispositionReason::Success);
    assert_eq!(disposition.payload, Some(serde_json::json!({"id": 1})));
    assert_eq!(*setup.broker.acks.lock(), vec![1]);
    assert_eq!(setup.broker.nack_count(), 0);
    assert_eq!(setup.processor.stats().processed, 1);
    // The fingerprint moved from in-flight to processed.
    assert_eq!(setup.dedup.stats().in_flight, 0);
    assert_eq!(setup.dedup.stats().processed, 1);
}

#[tokio::test]
async fn duplicate_delivery_is_skipped_with_no_broker_operation() {
    let setup = pipeline_setup(200).await;
    let snapshot = snapshot_for("orders", &setup.webhook_url);
    let payload = br#"{"id":1}"#;

    let first = setup
        .processor
        .process_message(&delivery(1, payload), &snapshot)
        .await;
    assert_eq!(first.reason, DispositionReason::Success);

    // Same delivery tag and payload: same fingerprint.
    let second = setup
        .processor
        .process_message(&delivery(1, payload), &snapshot)
        .await;
    assert_eq!(second.action, DispositionAction::Skip);
    assert_eq!(second.reason, DispositionReason::Duplicate);

    // The duplicate branch must touch the broker with NEITHER ack NOR nack:
    // its fingerprint belongs to an already-settled delivery tag, and any
    // broker operation on it would poison the channel.
    assert_eq!(setup.broker.ack_count(), 1);
    assert_eq!(setup.broker.nack_count(), 0);
    assert_eq!(setup.webhook_hits.load(Ordering::SeqCst), 1);

    let stats = setup.processor.stats();
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.skipped, 1);
}

#[tokio::test]
async fn redelivery_gets_fresh_fingerprint_and_is_reprocessed() {
    let setup = pipeline_setup(200).await;
    let snapshot = snapshot_for("orders", &setup.webhook_url);
    let payload = br#"{"id":1}"#;

    setup
        .processor
        .process_message(&delivery(1, payload), &snapshot)
        .await;
    // A broker redelivery arrives under a new delivery tag.
    let redelivered = setup
        .processor
        .process_message(&delivery(2, payload), &snapshot)
        .await;

    assert_eq!(redelivered.reason, DispositionReason::Success);
    assert_eq!(setup.broker.ack_count(), 2);
    assert_eq!(setup.processor.stats().duplicates, 0);
}

#[tokio::test]
async fn terminal_4xx_acks_and_drops_the_message() {
    let setup = pipeline_setup(404).await;
    let snapshot = snapshot_for("orders", &setup.webhook_url);

    let disposition = setup
        .processor
        .process_message(&delivery(7, br#"{"id":9}"#), &snapshot)
        .await;

    assert_eq!(disposition.action, DispositionAction::Ack);
    assert_eq!(disposition.reason, DispositionReason::WebhookPermanentError);
    // Acked, not requeued: the message never returns to the queue.
    assert_eq!(*setup.broker.acks.lock(), vec![7]);
    assert_eq!(setup.broker.nack_count(), 0);
    // No retries on terminal status.
    assert_eq!(setup.webhook_hits.load(Ordering::SeqCst), 1);
    assert_eq!(setup.processor.stats().failed, 1);
}

#[tokio::test]
async fn retryable_5xx_exhausts_attempts_then_requeues() {
    let setup = pipeline_setup(500).await;
    let snapshot = snapshot_for("orders", &setup.webhook_url);

    let disposition = setup
        .processor
        .process_message(&delivery(3, br#"{"id":2}"#), &snapshot)
        .await;

    assert_eq!(disposition.action, DispositionAction::Nack);
    assert_eq!(disposition.reason, DispositionReason::WebhookRetry);
    assert_eq!(*setup.broker.nacks.lock(), vec![(3, true)]);
    assert_eq!(setup.broker.ack_count(), 0);
    // All configured attempts were spent.
    assert_eq!(setup.webhook_hits.load(Ordering::SeqCst), 3);
    assert_eq!(setup.processor.stats().failed, 1);
    // A requeued message keeps its fingerprint out of the processed set so
    // the redelivery is processed again.
    assert_eq!(setup.dedup.stats().processed, 0);
}

#[tokio::test]
async fn paused_config_requeues_without_calling_webhook() {
    let setup = pipeline_setup(200).await;
    let mut snapshot = snapshot_for("orders", &setup.webhook_url);
    snapshot.paused = true;

    let disposition = setup
        .processor
        .process_message(&delivery(4, br#"{"id":5}"#), &snapshot)
        .await;

    assert_eq!(disposition.action, DispositionAction::Nack);
    assert_eq!(disposition.reason, DispositionReason::Paused);
    assert_eq!(*setup.broker.nacks.lock(), vec![(4, true)]);
    assert_eq!(setup.webhook_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn outside_business_hours_requeues_without_calling_webhook() {
    let setup = pipeline_setup(200).await;
    let mut snapshot = snapshot_for("orders", &setup.webhook_url);
    snapshot.business_hours = hours_excluding_now();

    let disposition = setup
        .processor
        .process_message(&delivery(5, br#"{"id":5}"#), &snapshot)
        .await;

    assert_eq!(disposition.action, DispositionAction::Nack);
    assert_eq!(disposition.reason, DispositionReason::OutsideBusinessHours);
    assert_eq!(*setup.broker.nacks.lock(), vec![(5, true)]);
    assert_eq!(setup.webhook_hits.load(Ordering::SeqCst), 0);
    assert_eq!(setup.processor.stats().outside_business_hours, 1);
}

#[tokio::test]
async fn malformed_payload_is_acked_and_never_blocks_the_queue() {
    let setup = pipeline_setup(200).await;
    let snapshot = snapshot_for("orders", &setup.webhook_url);

    let disposition = setup
        .processor
        .process_message(&delivery(6, b"definitely not json"), &snapshot)
        .await;

    assert_eq!(disposition.action, DispositionAction::Ack);
    assert_eq!(disposition.reason, DispositionReason::ParseError);
    assert_eq!(*setup.broker.acks.lock(), vec![6]);
    assert_eq!(setup.webhook_hits.load(Ordering::SeqCst), 0);
    assert_eq!(setup.processor.stats().failed, 1);

    // Permanently dropped: the same delivery re-injected is a duplicate.
    let again = setup
        .processor
        .process_message(&delivery(6, b"definitely not json"), &snapshot)
        .await;
    assert_eq!(again.reason, DispositionReason::Duplicate);
}

#[tokio::test]
async fn failed_ack_degrades_to_requeue_and_counts_the_message_once() {
    let setup = pipeline_setup(404).await;
    setup.broker.fail_acks();
    let snapshot = snapshot_for("orders", &setup.webhook_url);

    let disposition = setup
        .processor
        .process_message(&delivery(9, br#"{"id":3}"#), &snapshot)
        .await;

    // The 4xx wanted an ack-and-drop; with the ack broken the safety net
    // hands the message back to the broker instead.
    assert_eq!(disposition.action, DispositionAction::Nack);
    assert_eq!(disposition.reason, DispositionReason::UnexpectedError);
    assert_eq!(*setup.broker.nacks.lock(), vec![(9, true)]);
    // One message, one failure — the degraded settle path must not count
    // it twice.
    assert_eq!(setup.processor.stats().failed, 1);
}

#[tokio::test]
async fn every_exit_path_clears_the_in_flight_entry() {
    for status in [200u16, 404, 500] {
        let setup = pipeline_setup(status).await;
        let snapshot = snapshot_for("orders", &setup.webhook_url);
        setup
            .processor
            .process_message(&delivery(1, br#"{"id":1}"#), &snapshot)
            .await;
        assert_eq!(
            setup.dedup.stats().in_flight,
            0,
            "in-flight entry leaked for status {status}"
        );
    }
}
