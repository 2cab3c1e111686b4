use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use storefront_auth::prelude::*;
use storefront_auth::{
    Clock, KeyRing, ManualClock, SigningAlgorithm, VerificationSender, VerificationToken,
};
use time::Duration;

#[derive(Default)]
struct Outbox(Mutex<Vec<VerificationToken>>);

impl Outbox {
    fn sent(&self) -> Vec<VerificationToken> {
        self.0.lock().clone()
    }

    fn last(&self) -> String {
        self.0.lock().last().expect("a token was sent").token.clone()
    }
}

#[async_trait]
impl VerificationSender for Outbox {
    async fn send(&self, token: &VerificationToken) -> AuthResult<()> {
        self.0.lock().push(token.clone());
        Ok(())
    }
}

fn orchestrator() -> (Arc<SessionOrchestrator>, ManualClock, Arc<Outbox>) {
    let clock = ManualClock::starting_now();
    let keys = Arc::new(KeyRing::generate(SigningAlgorithm::HS256, clock.now()).expect("keys"));
    let outbox = Arc::new(Outbox::default());
    let orchestrator = SessionOrchestrator::with_keys(
        AuthStores::in_memory(),
        keys,
        Arc::new(clock.clone()),
        AuthConfig::default(),
    )
    .with_verification_sender(Arc::clone(&outbox) as Arc<dyn VerificationSender>);
    (Arc::new(orchestrator), clock, outbox)
}

#[tokio::test]
async fn pending_account_logs_in_after_verification() {
    let (auth, _, outbox) = orchestrator();
    let credential = auth.register("alice", "P@ss1234").await.expect("register");
    assert!(credential.verified_at.is_none());

    let sent = outbox.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "alice");
    assert_eq!(sent[0].expires_at - sent[0].created_at, Duration::minutes(15));

    let err = auth.login("alice", "P@ss1234", None).await.unwrap_err();
    assert!(matches!(err, AuthError::AccountNotVerified), "got {err:?}");
    // The pending state is only revealed to the right password.
    let err = auth.login("alice", "wrong-pass", None).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidCredentials), "got {err:?}");

    let verified = auth.verify_account(&outbox.last()).await.expect("verify");
    assert!(verified.verified_at.is_some());
    assert!(auth.login("alice", "P@ss1234", None).await.is_ok());
}

#[tokio::test]
async fn reused_token_is_rejected() {
    let (auth, _, outbox) = orchestrator();
    auth.register("alice", "P@ss1234").await.unwrap();
    let token = outbox.last();

    auth.verify_account(&token).await.unwrap();
    let err = auth.verify_account(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidVerificationToken { .. }));
    assert!(err.to_string().contains("already used"));
}

#[tokio::test]
async fn concurrent_redemptions_have_one_winner() {
    let (auth, _, outbox) = orchestrator();
    auth.register("alice", "P@ss1234").await.unwrap();
    let token = outbox.last();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let auth = Arc::clone(&auth);
        let token = token.clone();
        handles.push(tokio::spawn(async move { auth.verify_account(&token).await }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn expired_token_is_rejected_and_resend_recovers() {
    let (auth, clock, outbox) = orchestrator();
    auth.register("alice", "P@ss1234").await.unwrap();
    let stale = outbox.last();

    clock.advance(Duration::minutes(16));
    let err = auth.verify_account(&stale).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidVerificationToken { .. }));
    assert!(err.to_string().contains("expired"));

    let fresh = auth.resend_verification("alice").await.expect("resend");
    assert_ne!(fresh.token, stale);
    assert_eq!(outbox.last(), fresh.token);
    auth.verify_account(&fresh.token).await.unwrap();
    assert!(auth.login("alice", "P@ss1234", None).await.is_ok());
}

#[tokio::test]
async fn second_token_after_verification_reports_already_verified() {
    let (auth, _, outbox) = orchestrator();
    auth.register("alice", "P@ss1234").await.unwrap();
    let first = outbox.last();
    let second = auth.resend_verification("alice").await.unwrap().token;

    auth.verify_account(&first).await.unwrap();
    let err = auth.verify_account(&second).await.unwrap_err();
    assert!(matches!(err, AuthError::AlreadyVerified { .. }), "got {err:?}");
}

#[tokio::test]
async fn resend_rules() {
    let (auth, _, outbox) = orchestrator();
    assert!(matches!(
        auth.resend_verification("ghost").await.unwrap_err(),
        AuthError::UnknownSubject { .. }
    ));

    auth.register("alice", "P@ss1234").await.unwrap();
    auth.verify_account(&outbox.last()).await.unwrap();
    assert!(matches!(
        auth.resend_verification("alice").await.unwrap_err(),
        AuthError::AlreadyVerified { .. }
    ));

    auth.register("bob", "P@ss1234").await.unwrap();
    auth.close_account("bob").await.unwrap();
    assert!(matches!(
        auth.resend_verification("bob").await.unwrap_err(),
        AuthError::UnknownSubject { .. }
    ));
}

#[tokio::test]
async fn closed_account_cannot_be_verified() {
    let (auth, _, outbox) = orchestrator();
    auth.register("alice", "P@ss1234").await.unwrap();
    let token = outbox.last();
    auth.close_account("alice").await.unwrap();

    let err = auth.verify_account(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidCredentials), "got {err:?}");
}

#[tokio::test]
async fn verification_can_be_turned_off() {
    let mut config = AuthConfig::default();
    config.credentials.require_verification = false;
    let auth = SessionOrchestrator::in_memory(config).await.unwrap();

    let credential = auth.register("alice", "P@ss1234").await.unwrap();
    assert!(credential.verified_at.is_some());
    assert!(auth.login("alice", "P@ss1234", None).await.is_ok());
}
