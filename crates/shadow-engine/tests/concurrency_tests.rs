//! Single-active-evaluation and input ordering under concurrency.

use std::sync::Arc;

use serde_json::json;
use shadow_core::{ProposalMetadata, ProposalState, Scope, VersionId};
use shadow_engine::{EngineError, LeaseHolder};
use shadow_test_utils::{
    drive_until_settled, engine_with, fast_settings, threshold_diff, wait_for_idle, ScriptedJudge,
    ScriptedPolicy,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_admit_exactly_one() {
    let (engine, _) = engine_with(
        ScriptedPolicy::new(),
        Arc::new(ScriptedJudge::divergence(0.02)),
        fast_settings(),
    );

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .submit_proposal(
                        threshold_diff(0.5 + f64::from(i) / 100.0),
                        Scope::Config,
                        ProposalMetadata::new(format!("candidate {i}")),
                    )
                    .await
            })
        })
        .collect();

    let mut admitted = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(id) => admitted.push(id),
            Err(e) => {
                assert!(matches!(e, EngineError::ResourceExhausted { .. }), "unexpected error {e}");
                assert!(e.is_retryable());
            }
        }
    }
    assert_eq!(admitted.len(), 1);
    assert_eq!(engine.active_lease(), Some(LeaseHolder::Evaluation(admitted[0])));
    engine.shutdown();
}

#[tokio::test]
async fn next_proposal_admitted_after_verdict() {
    let (engine, _) = engine_with(
        ScriptedPolicy::new(),
        Arc::new(ScriptedJudge::divergence(0.02)),
        fast_settings(),
    );
    let first = engine
        .submit_proposal(threshold_diff(0.5), Scope::Config, ProposalMetadata::new("first"))
        .await
        .unwrap();
    let busy = engine
        .submit_proposal(threshold_diff(0.6), Scope::Config, ProposalMetadata::new("second"))
        .await;
    assert!(matches!(busy, Err(EngineError::ResourceExhausted { .. })));

    assert_eq!(drive_until_settled(&engine, first, 10).await.state, ProposalState::Approved);
    wait_for_idle(&engine).await;

    let second = engine
        .submit_proposal(threshold_diff(0.6), Scope::Config, ProposalMetadata::new("second"))
        .await
        .unwrap();
    assert_eq!(drive_until_settled(&engine, second, 10).await.state, ProposalState::Approved);
    assert_eq!(engine.current_configuration().version(), VersionId(3));
    assert_eq!(
        engine.current_configuration().get("/retrieval/threshold"),
        Some(&json!(0.6))
    );
}

/// Primary service does not depend on an evaluation being active.
#[tokio::test]
async fn primary_serves_without_evaluation() {
    let (engine, _) = engine_with(
        ScriptedPolicy::new(),
        Arc::new(ScriptedJudge::divergence(0.0)),
        fast_settings(),
    );
    let first = engine.handle_input(json!({"text": "hello"})).await;
    let second = engine.handle_input(json!({"text": "again"})).await;
    assert_eq!(first.seq + 1, second.seq);
    assert_eq!(first.version, VersionId::GENESIS);
    assert_eq!(first.response, json!({"echo": {"text": "hello"}}));
    assert!(first.error.is_none());
}

/// Inputs served from many tasks reach the shadow in sequence order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shadow_sees_inputs_in_primary_order() {
    let (engine, _) = engine_with(
        ScriptedPolicy::new(),
        Arc::new(ScriptedJudge::divergence(0.0)),
        fast_settings(),
    );
    let id = engine
        .submit_proposal(threshold_diff(0.5), Scope::Config, ProposalMetadata::new("ordered"))
        .await
        .unwrap();

    let served: Vec<_> = (0..10)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.handle_input(json!({"text": format!("burst {i}")})).await })
        })
        .collect();
    for handle in served {
        handle.await.unwrap();
    }

    let status = engine.wait_until_settled(id).await.unwrap();
    assert_eq!(status.state, ProposalState::Approved);

    let entry = engine.golden_trace().last().unwrap();
    let evidence = entry.evidence.unwrap();
    let primary: Vec<u64> = evidence.primary.iter().map(|t| t.seq).collect();
    let shadow: Vec<u64> = evidence.shadow.iter().map(|t| t.seq).collect();
    assert_eq!(primary, shadow);
    assert!(shadow.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(shadow.len(), 10);
}
