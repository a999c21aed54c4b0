// Integration tests for the authorization lifecycle, driven end-to-end
// through the feed channel: requests go out via the transport double and
// completions come back as routed events, exactly as a provider session
// delivers them.

mod common;

use common::{
    auth_failure, auth_revoked, auth_success, core_with_recorder, open_services, response,
    session_terminated, TransportCall,
};
use feedgate::distributor::{CoreError, QueryError};
use feedgate::entitlement::Verdict;
use feedgate::identity::IdentityState;
use feedgate::transport::AuthParams;
use std::time::Duration;

fn token_params() -> AuthParams {
    AuthParams::Token("oob-token".to_string())
}

// ── success path ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_authorization_success_via_event_stream() {
    let (mut core, tx, transport) = core_with_recorder();

    let token = core.authorize_user("user1:10.0.0.1", &token_params()).await.unwrap();
    assert_eq!(core.identity_state("user1:10.0.0.1"), Some(IdentityState::Pending));
    assert!(transport.calls().contains(&TransportCall::Authorization {
        user_id: "user1:10.0.0.1".to_string(),
        token,
    }));

    tx.send(auth_success(token, &[5, 9])).await.unwrap();
    core.pump().await.unwrap();

    assert_eq!(
        core.identity_state("user1:10.0.0.1"),
        Some(IdentityState::Authorized)
    );
}

// ── failure and retry ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_failure_is_local_and_retry_mints_new_token() {
    let (mut core, tx, _transport) = core_with_recorder();
    let mut notices = core.subscribe_auth();

    let t1 = core.authorize_user("u1", &token_params()).await.unwrap();
    let t2 = core.authorize_user("u2", &token_params()).await.unwrap();

    tx.send(auth_failure(t1, "not entitled")).await.unwrap();
    core.pump().await.unwrap();

    // u1 failed with the routed reason; u2 is untouched
    assert_eq!(core.identity_state("u1"), Some(IdentityState::Failed));
    assert_eq!(core.identity_state("u2"), Some(IdentityState::Pending));

    let failed = loop {
        let notice = notices.try_recv().unwrap();
        if notice.state == IdentityState::Failed {
            break notice;
        }
    };
    assert_eq!(failed.user_id, "u1");
    assert_eq!(failed.reason.as_deref(), Some("not entitled"));

    let retry = core.authorize_user("u1", &token_params()).await.unwrap();
    assert_ne!(retry, t1);
    assert_ne!(retry, t2);
    assert_eq!(core.identity_state("u1"), Some(IdentityState::Pending));
}

// ── duplicate success events ─────────────────────────────────────────────────

#[tokio::test]
async fn test_duplicate_success_does_not_replay_twice() {
    let (mut core, tx, _transport) = core_with_recorder();
    open_services(&mut core, &tx).await;

    let data = core
        .request_market_data(vec!["S1".to_string(), "S2".to_string()], vec!["BID".to_string()])
        .await
        .unwrap();
    tx.send(response(data, &[("S1", &[]), ("S2", &[])], true)).await.unwrap();
    core.pump().await.unwrap();

    let mut updates = core.subscribe_updates();
    let auth = core.authorize_user("u1", &token_params()).await.unwrap();
    tx.send(auth_success(auth, &[])).await.unwrap();
    tx.send(auth_success(auth, &[])).await.unwrap();
    core.pump().await.unwrap();

    // One replay's worth of updates, not two
    assert!(updates.try_recv().is_ok());
    assert!(updates.try_recv().is_ok());
    assert!(updates.try_recv().is_err());
}

// ── revocation fails closed ──────────────────────────────────────────────────

#[tokio::test]
async fn test_revocation_after_replay_fails_closed() {
    let (mut core, tx, _transport) = core_with_recorder();
    open_services(&mut core, &tx).await;

    let data = core
        .request_market_data(vec!["S1".to_string()], vec!["BID".to_string()])
        .await
        .unwrap();
    tx.send(response(data, &[("S1", &[5])], true)).await.unwrap();
    core.pump().await.unwrap();

    let mut updates = core.subscribe_updates();
    let auth = core.authorize_user("u3", &token_params()).await.unwrap();
    tx.send(auth_success(auth, &[5])).await.unwrap();
    core.pump().await.unwrap();

    // u3 received the replayed item and can query it
    assert_eq!(updates.try_recv().unwrap().verdict, Verdict::Entitled);
    assert_eq!(core.visibility("u3", "S1"), Ok(Verdict::Entitled));

    tx.send(auth_revoked(auth)).await.unwrap();
    core.pump().await.unwrap();

    assert_eq!(core.identity_state("u3"), Some(IdentityState::Revoked));
    assert_eq!(
        core.visibility("u3", "S1"),
        Err(QueryError::NotAuthorized("u3".to_string()))
    );
}

// ── session termination ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_termination_forces_pending_terminal_and_releases_barrier() {
    let (mut core, tx, _transport) = core_with_recorder();

    let token = core.authorize_user("u2", &token_params()).await.unwrap();
    let barrier = core.barrier_for([token]);
    let waiter = tokio::spawn(barrier.wait());

    tx.send(session_terminated("provider disconnect")).await.unwrap();
    let err = core.pump().await.unwrap_err();
    assert!(matches!(err, CoreError::SessionTerminated { .. }));

    assert_eq!(core.identity_state("u2"), Some(IdentityState::Failed));
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("termination did not release the barrier")
        .unwrap();

    // The dead session refuses new work
    let err = core.authorize_user("u9", &token_params()).await.unwrap_err();
    assert!(matches!(err, CoreError::SessionTerminated { .. }));
}

#[tokio::test]
async fn test_termination_cancels_outstanding_data_request() {
    let (mut core, tx, transport) = core_with_recorder();
    open_services(&mut core, &tx).await;

    let data = core
        .request_market_data(vec!["S1".to_string()], vec!["BID".to_string()])
        .await
        .unwrap();
    // Only a partial has arrived; the operation is still outstanding
    tx.send(response(data, &[("S1", &[])], false)).await.unwrap();
    core.pump().await.unwrap();

    tx.send(session_terminated("provider disconnect")).await.unwrap();
    let err = core.pump().await.unwrap_err();
    assert!(matches!(err, CoreError::SessionTerminated { .. }));

    assert!(transport.calls().contains(&TransportCall::Cancel(vec![data])));
}

// ── run loop ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_run_processes_until_feed_closes() {
    let (mut core, tx, _transport) = core_with_recorder();

    let auth = core.authorize_user("u1", &token_params()).await.unwrap();
    tx.send(auth_success(auth, &[5])).await.unwrap();
    drop(tx);

    core.run().await.unwrap();
    assert_eq!(core.identity_state("u1"), Some(IdentityState::Authorized));
}

#[tokio::test]
async fn test_run_surfaces_session_termination() {
    let (mut core, tx, _transport) = core_with_recorder();

    tx.send(session_terminated("maintenance window")).await.unwrap();

    let err = core.run().await.unwrap_err();
    match err {
        CoreError::SessionTerminated { reason } => assert_eq!(reason, "maintenance window"),
        other => panic!("expected SessionTerminated, got {:?}", other),
    }
}
