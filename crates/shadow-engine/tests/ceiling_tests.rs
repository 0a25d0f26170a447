//! Run ceilings.
//!
//! - The wall-clock ceiling fires even while a shadow turn or a judge call
//!   never returns, forcing ESCALATE and releasing the lease.
//! - The turn ceiling stops a run that keeps extending.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use shadow_core::{ProposalMetadata, ProposalState, Scope, VerdictKind, VersionId};
use shadow_test_utils::{
    drive_until_settled, engine_with, fast_settings, mode_diff, threshold_diff, wait_for_idle,
    Action, ScriptedJudge, ScriptedPolicy, Trigger,
};

#[tokio::test]
async fn hung_shadow_turn_escalates_at_wall_clock_ceiling() {
    let mut settings = fast_settings();
    settings.max_run_duration_secs = 1;
    let policy = ScriptedPolicy::new().when(Trigger::config("/mode", json!("stalled")), Action::Stall);
    let (engine, _) = engine_with(policy, Arc::new(ScriptedJudge::divergence(0.02)), settings);

    let id = engine
        .submit_proposal(mode_diff("stalled"), Scope::Config, ProposalMetadata::new("stall"))
        .await
        .unwrap();
    let status = drive_until_settled(&engine, id, 1).await;

    assert_eq!(status.state, ProposalState::Escalated);
    assert_eq!(status.verdict, Some(VerdictKind::Escalate));
    assert_eq!(status.turns_evaluated, 0);
    assert!(status.reason.unwrap().contains("ceiling"));

    wait_for_idle(&engine).await;
    let entries = engine.golden_trace().by_proposal(id);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind(), VerdictKind::Escalate);
    assert_eq!(engine.pending_escalations(), vec![id]);
    assert_eq!(engine.current_configuration().version(), VersionId::GENESIS);

    // Primary service never waited on the hung shadow, and the lease is free
    let served = engine.handle_input(json!({"text": "still serving"})).await;
    assert_eq!(served.version, VersionId::GENESIS);
    engine
        .submit_proposal(threshold_diff(0.5), Scope::Config, ProposalMetadata::new("next"))
        .await
        .unwrap();
    engine.shutdown();
}

#[tokio::test]
async fn stalled_judge_escalates_at_wall_clock_ceiling() {
    let mut settings = fast_settings();
    settings.max_run_duration_secs = 1;
    settings.judgment.timeout_ms = 60_000;
    let judge = Arc::new(ScriptedJudge::stalled());
    let (engine, _) = engine_with(ScriptedPolicy::new(), judge.clone(), settings);

    let id = engine
        .submit_proposal(threshold_diff(0.5), Scope::Config, ProposalMetadata::new("slow judge"))
        .await
        .unwrap();
    let status = drive_until_settled(&engine, id, 10).await;

    assert_eq!(status.state, ProposalState::Escalated);
    assert!(status.reason.unwrap().contains("ceiling"));
    assert!(judge.calls() <= 1);
    wait_for_idle(&engine).await;
    assert_eq!(engine.current_configuration().version(), VersionId::GENESIS);
}

/// Borderline divergence keeps extending; twelve turns is the hard stop.
#[tokio::test]
async fn turn_ceiling_stops_extending_run() {
    let mut settings = fast_settings();
    settings.max_turns = 12;
    let (engine, _) = engine_with(ScriptedPolicy::new(), Arc::new(ScriptedJudge::divergence(0.2)), settings);

    let id = engine
        .submit_proposal(threshold_diff(0.5), Scope::Config, ProposalMetadata::new("borderline"))
        .await
        .unwrap();
    let status = drive_until_settled(&engine, id, 20).await;

    assert_eq!(status.state, ProposalState::Escalated);
    assert_eq!(status.turns_evaluated, 12);
    assert_eq!(status.extensions, 1);
    assert!(status.reason.unwrap().contains("ceiling"));
}
