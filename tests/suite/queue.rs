//! Messages typed while a turn is in flight.

use std::time::Duration;

use relay_engine::scripted::ScriptedBackend;
use relay_engine::{StopReason, StreamEvent, TurnOutcome, TurnPhase, UiEvent};

use crate::common::{asks, bash, harness, reply, retry_attempts, user};

#[tokio::test]
async fn queued_message_cancels_stream_and_is_sent_next() {
    let mut h = harness(
        ScriptedBackend::new()
            .held_stream(vec![StreamEvent::TextDelta("working".into())])
            .stream(reply("switched")),
    )
    .build();

    let first = h.spawn_submit("first");
    h.wait_for_phase(TurnPhase::Streaming).await;

    assert_eq!(h.orchestrator.submit("second").await, TurnOutcome::Queued);
    assert_eq!(h.orchestrator.queue_snapshot(), vec!["second"]);

    assert_eq!(first.await.unwrap(), TurnOutcome::Completed);
    assert_eq!(h.sent(), vec![vec![user("first")], vec![user("second")]]);
    assert_eq!(h.backend.cancel_count(), 1);
    assert!(h.orchestrator.queue_snapshot().is_empty());
    assert!(
        h.drain_events()
            .contains(&UiEvent::QueueChanged(vec!["second".to_string()]))
    );
}

#[tokio::test]
async fn queued_messages_are_joined_in_order() {
    let h = harness(
        ScriptedBackend::new()
            .held_stream(vec![StreamEvent::TextDelta("busy".into())])
            .stream(reply("ok")),
    )
    .build();

    let first = h.spawn_submit("start");
    h.wait_for_phase(TurnPhase::Streaming).await;

    for text in ["a", "b", "c"] {
        assert_eq!(h.orchestrator.submit(text).await, TurnOutcome::Queued);
    }
    assert_eq!(h.orchestrator.queue_snapshot(), vec!["a", "b", "c"]);

    assert_eq!(first.await.unwrap(), TurnOutcome::Completed);
    assert_eq!(h.sent()[1], vec![user("a\nb\nc")]);
    assert_eq!(h.backend.cancel_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn safety_net_aborts_when_backend_ignores_cancel() {
    let h = harness(
        ScriptedBackend::new()
            .ignoring_cancel()
            .held_stream(vec![StreamEvent::TextDelta("stuck".into())])
            .stream(reply("finally")),
    )
    .settings(|s| s.cancel_timeout = Duration::from_secs(30))
    .build();

    let first = h.spawn_submit("first");
    h.wait_for_phase(TurnPhase::Streaming).await;
    let started = tokio::time::Instant::now();

    assert_eq!(h.orchestrator.submit("second").await, TurnOutcome::Queued);
    assert_eq!(first.await.unwrap(), TurnOutcome::Completed);

    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(h.sent()[1], vec![user("second")]);
    assert_eq!(h.orchestrator.phase(), TurnPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn provider_failure_during_cancel_window_sends_the_queue_instead_of_retrying() {
    let mut h = harness(
        ScriptedBackend::new()
            .ignoring_cancel()
            .held_stream(vec![StreamEvent::TextDelta("working".into())])
            .stream(reply("switched")),
    )
    .settings(|s| s.cancel_timeout = Duration::from_secs(30))
    .build();

    let first = h.spawn_submit("first");
    h.wait_for_phase(TurnPhase::Streaming).await;
    let started = tokio::time::Instant::now();

    assert_eq!(h.orchestrator.submit("second").await, TurnOutcome::Queued);
    assert!(h.backend.send_held(StreamEvent::Stop(StopReason::LlmApiError)));
    assert_eq!(first.await.unwrap(), TurnOutcome::Completed);

    assert_eq!(h.sent(), vec![vec![user("first")], vec![user("second")]]);
    assert!(started.elapsed() < Duration::from_secs(30));
    assert!(h.orchestrator.queue_snapshot().is_empty());
    assert!(retry_attempts(&h.drain_events()).is_empty());
    assert_eq!(h.backend.remaining_responses(), 0);
}

#[tokio::test]
async fn submit_during_review_waits_for_the_review() {
    let h = harness(
        ScriptedBackend::new()
            .stream(asks(vec![bash("c1", "ls")]))
            .stream(reply("listed"))
            .stream(reply("and then")),
    )
    .build();

    assert_eq!(h.orchestrator.submit("list").await, TurnOutcome::AwaitingReview);
    assert_eq!(h.orchestrator.submit("after").await, TurnOutcome::Queued);
    assert_eq!(h.backend.cancel_count(), 0);
    assert_eq!(h.orchestrator.phase(), TurnPhase::AwaitingReview);

    assert_eq!(h.orchestrator.approve(0).await, Ok(TurnOutcome::Completed));
    let sent = h.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(h.sent_approval_ids(1), vec!["c1"]);
    assert_eq!(sent[2], vec![user("after")]);
}

#[tokio::test]
async fn cancel_all_with_queue_sends_denials_and_message_together() {
    let h = harness(
        ScriptedBackend::new()
            .stream(asks(vec![bash("c1", "deploy")]))
            .stream(reply("ok")),
    )
    .build();

    h.orchestrator.submit("ship").await;
    h.orchestrator.submit("wait, stop").await;

    assert_eq!(h.orchestrator.cancel_all().await, Ok(TurnOutcome::Completed));
    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(h.sent_approval_ids(1), vec!["c1"]);
    assert_eq!(sent[1].last(), Some(&user("wait, stop")));
    assert_eq!(h.orchestrator.parked_results(), 0);
}

#[tokio::test]
async fn all_denied_batch_carries_the_queued_message() {
    let h = harness(
        ScriptedBackend::new()
            .stream(asks(vec![bash("c1", "rm -rf /")]))
            .stream(reply("understood")),
    )
    .build();

    h.orchestrator.submit("clean up").await;
    h.orchestrator.submit("use git clean instead").await;

    assert_eq!(
        h.orchestrator.deny(0, "too dangerous").await,
        Ok(TurnOutcome::Completed)
    );
    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].last(), Some(&user("use git clean instead")));
}
