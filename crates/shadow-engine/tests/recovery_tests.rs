//! Durable state across restarts.
//!
//! - Versions, golden trace and the evolutionary queue survive a reopen.
//! - A run interrupted mid-evaluation is finalized as REJECTED on reopen.
//! - Pending escalations survive a reopen and remain resolvable.

use std::sync::Arc;

use serde_json::json;
use shadow_core::{ProposalMetadata, ProposalState, Scope, VerdictKind, VersionId};
use shadow_engine::{EngineSettings, HumanVerdict, StateLayout, INTERRUPTED_REASON};
use shadow_ledger::Resolution;
use shadow_test_utils::{
    draft, drive, drive_until_settled, engine_with, fast_settings, mode_diff, threshold_diff,
    wait_for_idle, Action, ScriptedJudge, ScriptedPolicy, Trigger,
};

fn durable(dir: &tempfile::TempDir) -> EngineSettings {
    let mut settings = fast_settings();
    settings.state_dir = Some(dir.path().to_path_buf());
    settings
}

#[tokio::test]
async fn interrupted_run_is_rejected_on_restart() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let (engine, _) = engine_with(
            ScriptedPolicy::new(),
            Arc::new(ScriptedJudge::divergence(0.02)),
            durable(&dir),
        );
        let id = engine
            .submit_proposal(threshold_diff(0.5), Scope::Config, ProposalMetadata::new("crash me"))
            .await
            .unwrap();
        assert_eq!(drive(&engine, id, 3).await.state, ProposalState::Evaluating);
        engine.shutdown();
        id
    };

    let (engine, _) = engine_with(
        ScriptedPolicy::new(),
        Arc::new(ScriptedJudge::divergence(0.02)),
        durable(&dir),
    );
    assert_eq!(engine.recovery_report().rejected, 1);

    let status = engine.get_status(id).unwrap();
    assert_eq!(status.state, ProposalState::Rejected);
    assert!(status.reason.unwrap().contains(INTERRUPTED_REASON));
    assert_eq!(engine.current_configuration().version(), VersionId::GENESIS);

    let entry = engine.golden_trace().last().unwrap();
    assert_eq!(entry.resolved_by, Resolution::Recovery);
    assert!(engine.golden_trace().verify_integrity().is_ok());
    assert!(engine.active_lease().is_none());

    // A second reopen has nothing left to recover
    drop(engine);
    let (engine, _) = engine_with(
        ScriptedPolicy::new(),
        Arc::new(ScriptedJudge::divergence(0.02)),
        durable(&dir),
    );
    assert_eq!(engine.recovery_report().rejected, 0);
    assert_eq!(engine.golden_trace().len(), 1);
}

#[tokio::test]
async fn promoted_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let policy = ScriptedPolicy::new().when(
        Trigger::config("/mode", json!("explore")).at_turn(1),
        Action::Propose(draft(threshold_diff(0.7), Scope::Retrieval, "follow-up")),
    );

    let id = {
        let (engine, _) = engine_with(policy.clone(), Arc::new(ScriptedJudge::divergence(0.02)), durable(&dir));
        let id = engine
            .submit_proposal(mode_diff("explore"), Scope::Config, ProposalMetadata::new("explore"))
            .await
            .unwrap();
        assert_eq!(drive_until_settled(&engine, id, 10).await.state, ProposalState::Approved);
        wait_for_idle(&engine).await;
        id
    };

    let (engine, _) = engine_with(policy, Arc::new(ScriptedJudge::divergence(0.02)), durable(&dir));
    assert_eq!(engine.current_configuration().version(), VersionId(2));
    assert_eq!(engine.current_configuration().get("/mode"), Some(&json!("explore")));
    assert_eq!(engine.get_status(id).unwrap().state, ProposalState::Approved);

    let queued = engine.evolutionary_candidates();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].parent, id);
    assert_eq!(engine.generation_info().generation, 1);

    let layout = StateLayout::new(dir.path());
    for path in [layout.versions(), layout.golden_trace(), layout.evolution(), layout.runs()] {
        assert!(path.exists(), "{} missing", path.display());
    }
}

#[tokio::test]
async fn pending_escalation_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = durable(&dir);
    settings.scopes.behavioral.min_turns = 5;

    let id = {
        let (engine, _) = engine_with(
            ScriptedPolicy::new(),
            Arc::new(ScriptedJudge::divergence(0.5)),
            settings.clone(),
        );
        let id = engine
            .submit_proposal(mode_diff("formal"), Scope::Behavioral, ProposalMetadata::new("formal tone"))
            .await
            .unwrap();
        assert_eq!(drive_until_settled(&engine, id, 5).await.state, ProposalState::Escalated);
        wait_for_idle(&engine).await;
        id
    };

    let (engine, _) = engine_with(ScriptedPolicy::new(), Arc::new(ScriptedJudge::divergence(0.5)), settings);
    assert_eq!(engine.recovery_report().rejected, 0);
    assert_eq!(engine.pending_escalations(), vec![id]);
    assert_eq!(engine.get_status(id).unwrap().state, ProposalState::Escalated);

    let resolved = engine.resolve_escalation(id, HumanVerdict::Approve).await.unwrap();
    assert_eq!(resolved.state, ProposalState::Approved);
    assert_eq!(engine.current_configuration().version(), VersionId(2));

    let last = engine.golden_trace().last().unwrap();
    assert_eq!(last.kind(), VerdictKind::Approve);
    assert_eq!(last.resolved_by, Resolution::Human);
}

#[tokio::test]
async fn tampered_golden_trace_refuses_to_open() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (engine, _) = engine_with(
            ScriptedPolicy::new(),
            Arc::new(ScriptedJudge::divergence(0.02)),
            durable(&dir),
        );
        let id = engine
            .submit_proposal(threshold_diff(0.5), Scope::Config, ProposalMetadata::new("audited"))
            .await
            .unwrap();
        drive_until_settled(&engine, id, 10).await;
        wait_for_idle(&engine).await;
    }

    let path = StateLayout::new(dir.path()).golden_trace();
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replace("\"APPROVE\"", "\"REJECT\"")).unwrap();

    let built = shadow_engine::ShadowEngine::builder(
        Arc::new(ScriptedPolicy::new()),
        Arc::new(shadow_test_utils::CountingGateway::new()),
    )
    .settings(durable(&dir))
    .build();
    assert!(built.is_err());
}
