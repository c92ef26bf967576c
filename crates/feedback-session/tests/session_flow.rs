mod common;

use common::{MockServer, Recorded, Reply, client_for, credential_for, feedback_json, user_json};
use feedback_session::monitor::NoHooks;
use feedback_session::optimistic::{Entity, VoteState};
use feedback_session::storage::ACCESS_TOKEN_KEY;
use feedback_session::{
    ApiError, AuthSession, EntityCache, EntityId, EventKind, MonitorConfig, MutationCoordinator,
    MutationError, Reconciled, SessionMonitor, SessionState,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const EMAIL: &str = "reader@example.com";

fn session_for(server: &MockServer) -> AuthSession {
    let client = client_for(server);
    let monitor = Arc::new(SessionMonitor::new(
        MonitorConfig::default(),
        Arc::clone(&client.bus),
        Arc::new(NoHooks),
    ));
    AuthSession::new(client.storage, client.bus, monitor, client.api)
}

/// Routes a well-behaved server: any login succeeds, upvote 7 toggles on.
fn board(req: &Recorded) -> Reply {
    match (req.method.as_str(), req.path.as_str()) {
        ("POST", "/auth/login") => Reply::json(
            200,
            json!({
                "access_token": credential_for(EMAIL, 3600).as_str(),
                "token_type": "bearer"
            }),
        ),
        ("POST", "/auth/register") => Reply::json(201, user_json(3, EMAIL)),
        ("GET", "/auth/me") => Reply::json(200, user_json(3, EMAIL)),
        ("GET", "/feedback/7") => Reply::json(200, feedback_json(7, 4, false)),
        ("POST", "/feedback/7/upvote") => Reply::json(
            200,
            json!({"id": 7, "upvotes": 5, "has_upvoted": true, "message": "Upvote added"}),
        ),
        _ => Reply::json(404, json!({"detail": "Not Found"})),
    }
}

#[tokio::test]
async fn login_persists_and_starts_monitoring() {
    common::init_tracing();
    let server = MockServer::start(board).await;
    let session = session_for(&server);
    assert!(!session.is_authenticated());

    let credential = session.login(EMAIL, "correct horse").await.unwrap();
    assert_eq!(
        session.storage().get(ACCESS_TOKEN_KEY).as_deref(),
        Some(credential.as_str())
    );
    assert_eq!(session.state(), SessionState::Monitoring);
    assert!(session.is_authenticated());
    assert_eq!(
        credential.claims().unwrap().subject.as_deref(),
        Some(EMAIL)
    );

    let login = &server.requests()[0];
    let body: serde_json::Value = serde_json::from_str(&login.body).unwrap();
    assert_eq!(body, json!({"email": EMAIL, "password": "correct horse"}));
}

#[tokio::test]
async fn authenticated_calls_carry_the_credential() {
    let server = MockServer::start(board).await;
    let session = session_for(&server);
    let credential = session.login(EMAIL, "correct horse").await.unwrap();

    let me = session.api().me().await.unwrap();
    assert_eq!(me.id, 3);

    let reqs = server.requests();
    let expected = format!("Bearer {}", credential.as_str());
    assert_eq!(reqs[1].path, "/auth/me");
    assert_eq!(reqs[1].authorization.as_deref(), Some(expected.as_str()));
}

#[tokio::test]
async fn duplicate_registration_reports_server_detail() {
    let server = MockServer::start(|_| {
        Reply::json(400, json!({"detail": "Email already registered"}))
    })
    .await;
    let session = session_for(&server);

    let err = session.register(EMAIL, "password123").await.unwrap_err();
    assert_eq!(
        err,
        ApiError::Status {
            status: 400,
            message: "Email already registered".into()
        }
    );
}

#[tokio::test]
async fn short_password_is_rejected_without_a_request() {
    let server = MockServer::start(board).await;
    let session = session_for(&server);

    let err = session.register(EMAIL, "short").await.unwrap_err();
    assert!(matches!(err, ApiError::Invalid { .. }));
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn failed_login_leaves_session_empty() {
    let server = MockServer::start(|_| {
        Reply::json(401, json!({"detail": "Incorrect email or password"}))
    })
    .await;
    let session = session_for(&server);

    let err = session.login(EMAIL, "wrong").await.unwrap_err();
    assert!(err.is_unauthorized());
    assert_eq!(err.message(), "Incorrect email or password");
    assert_eq!(session.state(), SessionState::NoCredential);
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn restore_discards_expired_credential() {
    let server = MockServer::start(board).await;
    let session = session_for(&server);
    session
        .storage()
        .set(ACCESS_TOKEN_KEY, credential_for(EMAIL, -60).as_str());

    assert!(!session.restore());
    assert_eq!(session.storage().get(ACCESS_TOKEN_KEY), None);
    assert_eq!(session.state(), SessionState::NoCredential);
}

#[tokio::test]
async fn restore_resumes_live_credential() {
    let server = MockServer::start(board).await;
    let session = session_for(&server);
    let credential = credential_for(EMAIL, 1800);
    session.storage().set(ACCESS_TOKEN_KEY, credential.as_str());

    assert!(session.restore());
    assert_eq!(session.state(), SessionState::Monitoring);
    assert_eq!(session.credential(), Some(credential));
    assert!(session.is_authenticated());
}

#[tokio::test]
async fn restore_without_stored_credential() {
    let server = MockServer::start(board).await;
    let session = session_for(&server);
    assert!(!session.restore());
}

#[tokio::test(start_paused = true)]
async fn expiry_clears_the_stored_session() {
    let server = MockServer::start(board).await;
    let session = session_for(&server);
    let expired = Arc::new(AtomicUsize::new(0));
    let e = Arc::clone(&expired);
    session.bus().subscribe(EventKind::EXPIRED, move || {
        e.fetch_add(1, Ordering::SeqCst);
    });

    session
        .storage()
        .set(ACCESS_TOKEN_KEY, credential_for(EMAIL, 30).as_str());
    assert!(session.restore());
    assert!(session.is_authenticated());

    tokio::time::advance(Duration::from_secs(31)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(expired.load(Ordering::SeqCst), 1);
    assert_eq!(session.storage().get(ACCESS_TOKEN_KEY), None);
    assert_eq!(session.state(), SessionState::NoCredential);
    assert!(session.credential().is_none());
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn logout_clears_everything() {
    let server = MockServer::start(board).await;
    let session = session_for(&server);
    session.login(EMAIL, "correct horse").await.unwrap();

    session.logout();
    assert_eq!(session.storage().get(ACCESS_TOKEN_KEY), None);
    assert_eq!(session.state(), SessionState::NoCredential);
    assert!(session.monitor().time_left().is_none());
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn upvote_commits_server_state() {
    let server = MockServer::start(board).await;
    let session = session_for(&server);
    session.login(EMAIL, "correct horse").await.unwrap();

    let item = session.api().feedback(&EntityId::from(7)).await.unwrap();
    let cache = EntityCache::new();
    cache.upsert(Entity::from(&item));
    let coordinator = MutationCoordinator::new(Arc::clone(session.api()), cache);

    let id = EntityId::from(7);
    let pending = coordinator.toggle(&id).unwrap();
    assert_eq!(
        pending.optimistic(),
        VoteState {
            vote_count: 5,
            viewer_has_voted: true
        }
    );
    let settled = pending.settled().await.unwrap();
    assert_eq!(
        settled,
        Reconciled::Committed(VoteState {
            vote_count: 5,
            viewer_has_voted: true
        })
    );
    assert_eq!(
        coordinator.cache().get(&id).unwrap().votes(),
        VoteState {
            vote_count: 5,
            viewer_has_voted: true
        }
    );
}

#[tokio::test]
async fn rejected_credential_mid_session_logs_out_and_rolls_back() {
    let server = MockServer::start(|req| match req.path.as_str() {
        "/auth/login" => Reply::json(
            200,
            json!({
                "access_token": credential_for(EMAIL, 3600).as_str(),
                "token_type": "bearer"
            }),
        ),
        _ => Reply::json(401, json!({"detail": "Could not validate credentials"})),
    })
    .await;
    let session = session_for(&server);
    session.login(EMAIL, "correct horse").await.unwrap();
    assert!(session.is_authenticated());

    let cache = EntityCache::new();
    let id = EntityId::from(7);
    cache.upsert(Entity::new(
        id.clone(),
        VoteState {
            vote_count: 2,
            viewer_has_voted: false,
        },
    ));
    let coordinator = MutationCoordinator::new(Arc::clone(session.api()), cache);

    let err = coordinator.toggle(&id).unwrap().settled().await.unwrap_err();
    match err {
        MutationError::Rejected { source, .. } => assert!(source.is_unauthorized()),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(
        coordinator.cache().get(&id).unwrap().votes(),
        VoteState {
            vote_count: 2,
            viewer_has_voted: false
        }
    );
    assert_eq!(session.storage().get(ACCESS_TOKEN_KEY), None);
    assert_eq!(session.state(), SessionState::NoCredential);
    assert!(!session.is_authenticated());
}
