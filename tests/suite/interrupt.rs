//! User interrupts and stale continuations.

use std::time::Duration;

use relay_engine::scripted::ScriptedBackend;
use relay_engine::{
    ApprovalResult, INTERRUPTED_TOOL_RETURN, InterruptOutcome, ReviewError, StreamEvent,
    ToolStatus, TurnInput, TurnOutcome, TurnPhase, USER_CANCELLED_REASON, UiEvent,
};

use crate::common::{asks, bash, harness, read, reply, slow_tool, user};

#[tokio::test]
async fn interrupt_while_idle_is_a_no_op() {
    let mut h = harness(ScriptedBackend::new()).build();
    let before = h.orchestrator.generation();

    assert_eq!(h.orchestrator.interrupt(), InterruptOutcome::AlreadyIdle);
    assert_eq!(h.orchestrator.generation(), before);
    assert_eq!(h.backend.cancel_count(), 0);
    assert!(h.drain_events().is_empty());
}

#[tokio::test]
async fn interrupt_during_stream_restores_unseen_input() {
    let mut h = harness(ScriptedBackend::new().held_stream(Vec::new())).build();
    let before = h.orchestrator.generation();

    let turn = h.spawn_submit("draft question");
    h.wait_for_phase(TurnPhase::Streaming).await;

    let InterruptOutcome::Interrupted(generation) = h.orchestrator.interrupt() else {
        panic!("expected an interrupt");
    };
    assert!(generation > before);
    assert_eq!(h.orchestrator.phase(), TurnPhase::Idle);
    assert_eq!(turn.await.unwrap(), TurnOutcome::Superseded);

    let events = h.drain_events();
    assert!(events.contains(&UiEvent::Interrupted));
    assert_eq!(
        events.last(),
        Some(&UiEvent::RestoreInput("draft question".to_string()))
    );
    assert_eq!(h.orchestrator.interrupt(), InterruptOutcome::AlreadyIdle);
    assert_eq!(h.orchestrator.cancellation().active_turns(), 0);
}

#[tokio::test]
async fn stale_turn_commits_nothing_after_interrupt() {
    let mut h = harness(
        ScriptedBackend::new().held_stream(vec![StreamEvent::TextDelta("partial".into())]),
    )
    .build();

    let turn = h.spawn_submit("go");
    h.wait_for_phase(TurnPhase::Streaming).await;
    h.orchestrator.interrupt();
    let revision = h.orchestrator.state_revision();
    let _ = h.drain_events();

    assert_eq!(turn.await.unwrap(), TurnOutcome::Superseded);
    assert_eq!(h.orchestrator.state_revision(), revision);
    assert_eq!(h.orchestrator.phase(), TurnPhase::Idle);
    assert!(h.drain_events().is_empty());
}

#[tokio::test]
async fn interrupt_in_cancel_window_returns_queue_for_editing() {
    let mut h = harness(
        ScriptedBackend::new()
            .ignoring_cancel()
            .held_stream(vec![StreamEvent::TextDelta("thinking aloud".into())]),
    )
    .build();

    let turn = h.spawn_submit("first");
    h.wait_for_phase(TurnPhase::Streaming).await;
    assert_eq!(h.orchestrator.submit("actually").await, TurnOutcome::Queued);

    h.orchestrator.interrupt();
    assert_eq!(turn.await.unwrap(), TurnOutcome::Superseded);
    assert!(h.orchestrator.queue_snapshot().is_empty());

    let events = h.drain_events();
    assert!(events.contains(&UiEvent::QueueChanged(Vec::new())));
    assert!(events.contains(&UiEvent::RestoreInput("actually".to_string())));
    assert_eq!(h.sent().len(), 1);
}

#[tokio::test]
async fn interrupt_during_review_parks_cancellations() {
    let mut h = harness(
        ScriptedBackend::new()
            .stream(asks(vec![bash("c1", "cargo publish")]))
            .stream(reply("ok")),
    )
    .build();

    assert_eq!(h.orchestrator.submit("release").await, TurnOutcome::AwaitingReview);
    assert!(matches!(
        h.orchestrator.interrupt(),
        InterruptOutcome::Interrupted(_)
    ));
    assert_eq!(h.orchestrator.phase(), TurnPhase::Idle);
    assert_eq!(h.orchestrator.approve(0).await, Err(ReviewError::NoReview));
    assert!(
        h.drain_events()
            .iter()
            .any(|e| matches!(e, UiEvent::ApprovalPrompt(s) if !s.is_open()))
    );

    assert_eq!(h.orchestrator.submit("not yet").await, TurnOutcome::Completed);
    assert_eq!(
        h.sent()[1],
        vec![
            TurnInput::Approval(ApprovalResult::denial("c1", USER_CANCELLED_REASON)),
            user("not yet"),
        ]
    );
}

#[tokio::test]
async fn interrupt_during_tool_run_parks_interrupted_result() {
    let h = harness(
        ScriptedBackend::new()
            .stream(asks(vec![read("r1", "huge.log")]))
            .stream(reply("ok")),
    )
    .tool("Read", slow_tool(Duration::from_secs(600)))
    .build();

    let turn = h.spawn_submit("read it");
    h.wait_for_phase(TurnPhase::ExecutingTools).await;
    h.orchestrator.interrupt();

    assert_eq!(turn.await.unwrap(), TurnOutcome::Superseded);
    assert_eq!(h.orchestrator.parked_results(), 1);

    assert_eq!(h.orchestrator.submit("skip that").await, TurnOutcome::Completed);
    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    assert!(matches!(
        &sent[1][0],
        TurnInput::Approval(ApprovalResult::ToolReturn {
            tool_call_id,
            tool_return,
            status: ToolStatus::Error,
            ..
        }) if tool_call_id == "r1" && tool_return == INTERRUPTED_TOOL_RETURN
    ));
    assert_eq!(sent[1][1], user("skip that"));
}
