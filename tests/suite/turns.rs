//! Plain turns: submit, stream, end.

use relay_engine::scripted::ScriptedBackend;
use relay_engine::{
    BufferDelta, FEEDBACK_HINT, NotifyReason, StopReason, StreamEvent, SubmitRejection,
    TurnError, TurnOutcome, TurnPhase, UiEvent,
};

use crate::common::{harness, reply, user};

#[tokio::test]
async fn clean_turn_streams_and_returns_to_idle() {
    let mut h = harness(ScriptedBackend::new().stream(reply("Hello there"))).build();

    let outcome = h.orchestrator.submit("hi").await;

    assert_eq!(outcome, TurnOutcome::Completed);
    assert_eq!(h.orchestrator.phase(), TurnPhase::Idle);
    assert_eq!(h.sent(), vec![vec![user("hi")]]);

    let events = h.drain_events();
    assert_eq!(events.first(), Some(&UiEvent::StreamingChanged(true)));
    assert!(events.contains(&UiEvent::BufferUpdated(BufferDelta::Text(
        "Hello there".to_string()
    ))));
    assert!(events.iter().any(|e| matches!(
        e,
        UiEvent::TurnComplete {
            stop_reason: StopReason::EndTurn,
            ..
        }
    )));
    assert_eq!(events.last(), Some(&UiEvent::StreamingChanged(false)));
    assert!(!events.iter().any(|e| matches!(e, UiEvent::Notify(_))));
}

#[tokio::test]
async fn blank_input_is_rejected() {
    let h = harness(ScriptedBackend::new()).build();

    assert_eq!(
        h.orchestrator.submit("   ").await,
        TurnOutcome::Rejected(SubmitRejection::Empty)
    );
    assert!(h.sent().is_empty());
}

#[tokio::test]
async fn unattended_session_rings_on_completion() {
    let mut h = harness(ScriptedBackend::new().stream(reply("done")))
        .unattended()
        .build();

    h.orchestrator.submit("go").await;

    assert!(
        h.drain_events()
            .contains(&UiEvent::Notify(NotifyReason::TurnComplete))
    );
}

#[tokio::test]
async fn bell_can_be_disabled() {
    let mut h = harness(ScriptedBackend::new().stream(reply("done")))
        .unattended()
        .settings(|s| s.bell = false)
        .build();

    h.orchestrator.submit("go").await;

    assert!(!h.drain_events().iter().any(|e| matches!(e, UiEvent::Notify(_))));
}

#[tokio::test]
async fn reasoning_toggles_thinking_indicator() {
    let mut h = harness(ScriptedBackend::new().stream(vec![
        StreamEvent::ReasoningDelta("hmm".into()),
        StreamEvent::TextDelta("answer".into()),
        StreamEvent::Stop(StopReason::EndTurn),
    ]))
    .build();

    h.orchestrator.submit("think").await;

    let thinking: Vec<bool> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            UiEvent::Thinking(on) => Some(on),
            _ => None,
        })
        .collect();
    assert_eq!(thinking, vec![true, false]);
}

#[tokio::test]
async fn stream_without_stop_fails_and_restores_unseen_input() {
    let mut h = harness(ScriptedBackend::new().stream(Vec::new())).build();

    let outcome = h.orchestrator.submit("lost message").await;

    let TurnOutcome::Failed(TurnError::Fatal { message }) = outcome else {
        panic!("expected fatal failure, got {outcome:?}");
    };
    assert!(message.contains("without a stop reason"));

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        UiEvent::Error { hint: Some(hint), .. } if *hint == FEEDBACK_HINT.as_str()
    )));
    assert!(events.contains(&UiEvent::RestoreInput("lost message".to_string())));
    assert_eq!(h.orchestrator.phase(), TurnPhase::Idle);
}

#[tokio::test]
async fn input_seen_by_agent_is_not_restored() {
    let mut h = harness(ScriptedBackend::new().stream(vec![
        StreamEvent::TextDelta("partial".into()),
        StreamEvent::Stop(StopReason::Error),
    ]))
    .build();

    let outcome = h.orchestrator.submit("seen").await;

    assert!(matches!(outcome, TurnOutcome::Failed(TurnError::Fatal { .. })));
    assert!(
        !h.drain_events()
            .iter()
            .any(|e| matches!(e, UiEvent::RestoreInput(_)))
    );
}

#[tokio::test]
async fn server_side_cancel_ends_turn() {
    let mut h = harness(ScriptedBackend::new().stream(vec![
        StreamEvent::TextDelta("half".into()),
        StreamEvent::Stop(StopReason::Cancelled),
    ]))
    .build();

    assert_eq!(h.orchestrator.submit("go").await, TurnOutcome::Cancelled);
    assert_eq!(h.orchestrator.phase(), TurnPhase::Idle);
    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        UiEvent::TurnComplete {
            stop_reason: StopReason::Cancelled,
            ..
        }
    )));
}

#[tokio::test]
async fn sequential_turns_reuse_the_session() {
    let h = harness(
        ScriptedBackend::new()
            .stream(reply("one"))
            .stream(reply("two")),
    )
    .build();

    assert_eq!(h.orchestrator.submit("first").await, TurnOutcome::Completed);
    assert_eq!(h.orchestrator.submit("second").await, TurnOutcome::Completed);
    assert_eq!(h.sent(), vec![vec![user("first")], vec![user("second")]]);
    assert_eq!(h.orchestrator.cancellation().active_turns(), 0);
}
