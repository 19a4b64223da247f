//! Approval batches: auto-handling, sequential review, finalize.

use relay_engine::scripted::ScriptedBackend;
use relay_engine::{
    ApprovalResult, PermissionMode, ReviewError, RuleScope, StopReason, ToolStatus, TurnError,
    TurnInput, TurnOutcome, TurnPhase, USER_CANCELLED_REASON, UiEvent,
};

use crate::common::{asks, bash, harness, read, reply, request, stop, user, write};

fn approval_results(input: &[TurnInput]) -> Vec<ApprovalResult> {
    input.iter().filter_map(TurnInput::approval).cloned().collect()
}

#[tokio::test]
async fn single_approval_runs_after_approve() {
    let mut h = harness(
        ScriptedBackend::new()
            .stream(asks(vec![bash("c1", "ls")]))
            .stream(reply("listed")),
    )
    .build();

    assert_eq!(h.orchestrator.submit("list").await, TurnOutcome::AwaitingReview);
    assert_eq!(h.orchestrator.phase(), TurnPhase::AwaitingReview);
    let snapshot = h.orchestrator.review_snapshot();
    assert_eq!(snapshot.total, 1);
    assert_eq!(snapshot.active.unwrap().tool_call_id, "c1");
    assert!(h.tools.calls().is_empty());

    assert_eq!(h.orchestrator.approve(0).await, Ok(TurnOutcome::Completed));

    assert_eq!(h.tools.calls().len(), 1);
    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    let results = approval_results(&sent[1]);
    assert_eq!(results.len(), 1);
    assert!(matches!(
        &results[0],
        ApprovalResult::ToolReturn { tool_call_id, status: ToolStatus::Success, .. } if tool_call_id == "c1"
    ));
    assert!(!h.orchestrator.review_snapshot().is_open());

    let events = h.drain_events();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, UiEvent::ApprovalPrompt(s) if s.is_open()))
    );
    assert!(events.iter().any(|e| matches!(e, UiEvent::ToolResult(_))));
}

#[tokio::test]
async fn read_only_batch_needs_no_review() {
    let h = harness(
        ScriptedBackend::new()
            .stream(asks(vec![read("r1", "src/lib.rs"), read("r2", "Cargo.toml")]))
            .stream(reply("read both")),
    )
    .build();

    assert_eq!(h.orchestrator.submit("read").await, TurnOutcome::Completed);
    assert_eq!(h.sent_approval_ids(1), vec!["r1", "r2"]);
    assert_eq!(h.tools.calls().len(), 2);
}

#[tokio::test]
async fn denying_a_pair_sends_both_denials_in_order() {
    let h = harness(
        ScriptedBackend::new()
            .stream(asks(vec![bash("c1", "rm a"), bash("c2", "rm b")]))
            .stream(reply("ok")),
    )
    .build();

    h.orchestrator.submit("clean").await;
    assert_eq!(
        h.orchestrator.deny(0, "keep a").await,
        Ok(TurnOutcome::AwaitingReview)
    );
    assert_eq!(
        h.orchestrator.deny(1, "keep b").await,
        Ok(TurnOutcome::Completed)
    );

    assert_eq!(
        approval_results(&h.sent()[1]),
        vec![
            ApprovalResult::denial("c1", "keep a"),
            ApprovalResult::denial("c2", "keep b"),
        ]
    );
    assert!(h.tools.calls().is_empty());
}

#[tokio::test]
async fn mixed_batch_returns_every_id_in_batch_order() {
    let batch = vec![
        read("c1", "a.rs"),
        bash("c2", "ls"),
        write("c3", "b.rs"),
        request("c4", "Grep", r#"{"pattern":"todo"}"#),
        bash("c5", "pwd"),
        request("c6", "Edit", r#"{"file_path":"c.rs"}"#),
        request("c7", "Glob", r#"{"pattern":"*.rs"}"#),
    ];
    let h = harness(ScriptedBackend::new().stream(asks(batch)).stream(reply("done")))
        .deny_rule("Edit")
        .build();

    assert_eq!(h.orchestrator.submit("work").await, TurnOutcome::AwaitingReview);
    let snapshot = h.orchestrator.review_snapshot();
    assert_eq!(snapshot.total, 3);
    let pending: Vec<_> = snapshot
        .pending
        .iter()
        .map(|r| r.tool_call_id.as_str())
        .collect();
    assert_eq!(pending, vec!["c3", "c5"]);

    assert_eq!(h.orchestrator.approve(0).await, Ok(TurnOutcome::AwaitingReview));
    assert_eq!(
        h.orchestrator.deny(1, "not that file").await,
        Ok(TurnOutcome::AwaitingReview)
    );
    assert_eq!(h.orchestrator.approve(2).await, Ok(TurnOutcome::Completed));

    assert_eq!(
        h.sent_approval_ids(1),
        vec!["c1", "c2", "c3", "c4", "c5", "c6", "c7"]
    );
    let results = approval_results(&h.sent()[1]);
    assert!(!results[0].is_denial());
    assert_eq!(results[2], ApprovalResult::denial("c3", "not that file"));
    assert!(results[5].is_denial());

    let ran: Vec<String> = h.tools.calls().into_iter().map(|(name, _)| name).collect();
    assert_eq!(ran.iter().filter(|name| *name == "Bash").count(), 2);
    assert!(!ran.contains(&"Edit".to_string()));
    assert!(!ran.contains(&"Write".to_string()));
}

#[tokio::test]
async fn approve_always_completes_when_rule_covers_the_rest() {
    let h = harness(
        ScriptedBackend::new()
            .stream(asks(vec![bash("c1", "ls -la"), bash("c2", "ls src")]))
            .stream(reply("listed")),
    )
    .build();

    h.orchestrator.submit("look").await;
    assert_eq!(
        h.orchestrator.approve_always(0, RuleScope::Session).await,
        Ok(TurnOutcome::Completed)
    );

    assert_eq!(h.tools.calls().len(), 2);
    assert_eq!(h.sent_approval_ids(1), vec!["c1", "c2"]);
    let rules = h.oracle.allow_rules();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].0.to_string(), "Bash(ls:*)");
}

#[tokio::test]
async fn approve_always_keeps_reviewing_uncovered_items() {
    let h = harness(
        ScriptedBackend::new().stream(asks(vec![bash("c1", "ls"), bash("c2", "rm -rf target")])),
    )
    .build();

    h.orchestrator.submit("tidy").await;
    assert_eq!(
        h.orchestrator.approve_always(0, RuleScope::Project).await,
        Ok(TurnOutcome::AwaitingReview)
    );
    let snapshot = h.orchestrator.review_snapshot();
    assert_eq!(snapshot.active_index, 1);
    assert_eq!(snapshot.active.unwrap().tool_call_id, "c2");
}

#[tokio::test]
async fn decisions_must_target_the_active_item() {
    let h = harness(ScriptedBackend::new().stream(asks(vec![bash("c1", "a"), bash("c2", "b")])))
        .build();

    assert_eq!(h.orchestrator.approve(0).await, Err(ReviewError::NoReview));
    h.orchestrator.submit("go").await;
    assert_eq!(
        h.orchestrator.approve(1).await,
        Err(ReviewError::NotActive { index: 1, active: 0 })
    );
    assert_eq!(h.orchestrator.review_snapshot().active_index, 0);
}

#[tokio::test]
async fn cancel_all_parks_denials_for_the_next_message() {
    let h = harness(
        ScriptedBackend::new()
            .stream(asks(vec![bash("c1", "make")]))
            .stream(reply("fine")),
    )
    .build();

    h.orchestrator.submit("build").await;
    assert_eq!(h.orchestrator.cancel_all().await, Ok(TurnOutcome::Cancelled));
    assert_eq!(h.orchestrator.phase(), TurnPhase::Idle);
    assert_eq!(h.orchestrator.parked_results(), 1);
    assert_eq!(h.sent().len(), 1);

    assert_eq!(h.orchestrator.submit("never mind").await, TurnOutcome::Completed);
    assert_eq!(
        h.sent()[1],
        vec![
            TurnInput::Approval(ApprovalResult::denial("c1", USER_CANCELLED_REASON)),
            user("never mind"),
        ]
    );
    assert_eq!(h.orchestrator.parked_results(), 0);
}

#[tokio::test]
async fn plan_mode_auto_denies_writes() {
    let h = harness(
        ScriptedBackend::new()
            .stream(asks(vec![write("w1", "main.rs")]))
            .stream(reply("planned")),
    )
    .build();
    h.orchestrator.set_permission_mode(PermissionMode::Plan);

    assert_eq!(h.orchestrator.submit("edit it").await, TurnOutcome::Completed);
    let results = approval_results(&h.sent()[1]);
    assert_eq!(results.len(), 1);
    assert!(results[0].is_denial());
    assert!(h.tools.calls().is_empty());
}

#[tokio::test]
async fn empty_approval_stop_fetches_pending_requests() {
    let h = harness(
        ScriptedBackend::new()
            .stream(stop(StopReason::RequiresApproval))
            .pending(vec![read("p1", "notes.md")])
            .stream(reply("read")),
    )
    .build();

    assert_eq!(h.orchestrator.submit("go").await, TurnOutcome::Completed);
    assert_eq!(h.sent_approval_ids(1), vec!["p1"]);
}

#[tokio::test]
async fn approval_stop_with_nothing_pending_is_fatal() {
    let h = harness(ScriptedBackend::new().stream(stop(StopReason::RequiresApproval))).build();

    let outcome = h.orchestrator.submit("go").await;
    assert!(matches!(outcome, TurnOutcome::Failed(TurnError::Fatal { .. })));
    assert_eq!(h.orchestrator.phase(), TurnPhase::Idle);
}

#[tokio::test]
async fn unattended_review_rings_the_bell() {
    let mut h = harness(ScriptedBackend::new().stream(asks(vec![bash("c1", "ls")])))
        .unattended()
        .build();

    h.orchestrator.submit("go").await;
    assert!(h.drain_events().contains(&UiEvent::Notify(
        relay_engine::NotifyReason::ApprovalNeeded
    )));
}

#[tokio::test]
async fn failing_tool_calls_return_errors_and_the_turn_goes_on() {
    let mut h = harness(
        ScriptedBackend::new()
            .stream(asks(vec![
                request("r1", "Read", "{\"file_path\": "),
                request("x1", "Teleport", r#"{"to":"mars"}"#),
            ]))
            .stream(reply("noted")),
    )
    .build();

    assert_eq!(h.orchestrator.submit("go").await, TurnOutcome::AwaitingReview);
    assert_eq!(h.orchestrator.approve(0).await, Ok(TurnOutcome::Completed));

    let results = approval_results(&h.sent()[1]);
    let returns: Vec<(&str, &str)> = results
        .iter()
        .map(|result| match result {
            ApprovalResult::ToolReturn {
                tool_call_id,
                tool_return,
                status: ToolStatus::Error,
                ..
            } => (tool_call_id.as_str(), tool_return.as_str()),
            other => panic!("expected an errored tool return, got {other:?}"),
        })
        .collect();
    assert_eq!(returns.len(), 2);
    assert_eq!(returns[0].0, "r1");
    assert!(returns[0].1.starts_with("Bad tool args"));
    assert_eq!(returns[1], ("x1", "Unknown tool: Teleport"));

    // The malformed call never reached the tool.
    let calls = h.tools.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "Teleport");
    assert!(
        !h.drain_events()
            .iter()
            .any(|e| matches!(e, UiEvent::Error { .. }))
    );
    assert_eq!(h.orchestrator.phase(), TurnPhase::Idle);
}
