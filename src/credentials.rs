//! `CredentialSource`: external collaborator for identity-provider sign-in.
//!
//! Concrete identity-provider implementations (e-mail/password, OAuth,
//! anonymous) live outside this crate; this module defines the contract
//! `EngineDataModel` drives and the refresh-scheduling policy.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Outcome of [`CredentialSource::sign_in`].
#[derive(Debug, Clone)]
pub enum SignInOutcome {
    SignedIn {
        user_id: String,
        id_token: String,
        refresh_token: String,
        expires_at: DateTime<Utc>,
        email: Option<String>,
    },
    Failed(String),
    Aborted,
}

/// Outcome of [`CredentialSource::delete_user`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub success: bool,
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn sign_in(&self) -> SignInOutcome;
    /// Attempt a token refresh using a previously stored refresh token. A
    /// `None` or empty refresh token forces a full [`Self::sign_in`].
    async fn refresh(&self, refresh_token: &str) -> SignInOutcome;
    async fn log_out(&self);
    async fn abort(&self);
    async fn delete_user(&self, id_token: &str) -> DeleteOutcome;
}

/// How long before `expires_at` the engine schedules a refresh attempt.
pub const REFRESH_LEAD: Duration = Duration::minutes(1);

/// Decide what the engine should do with the current credential set at
/// `now`. Pure function so the scheduling policy is unit-testable without a
/// real timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDecision {
    /// Nothing to do yet.
    Wait,
    /// Attempt a refresh using the stored refresh token.
    Refresh,
    /// No usable refresh token; a full sign-in is required.
    FullSignIn,
}

pub fn refresh_decision(
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    refresh_token: &str,
) -> RefreshDecision {
    if refresh_token.is_empty() {
        return RefreshDecision::FullSignIn;
    }
    if now >= expires_at - REFRESH_LEAD {
        RefreshDecision::Refresh
    } else {
        RefreshDecision::Wait
    }
}

/// Deterministic in-memory `CredentialSource`, for tests and the CLI.
pub struct StaticCredentialSource {
    pub user_id: String,
    pub id_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn sign_in(&self) -> SignInOutcome {
        SignInOutcome::SignedIn {
            user_id: self.user_id.clone(),
            id_token: self.id_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expires_at,
            email: None,
        }
    }

    async fn refresh(&self, refresh_token: &str) -> SignInOutcome {
        if refresh_token.is_empty() {
            return SignInOutcome::Failed("empty refresh token".into());
        }
        self.sign_in().await
    }

    async fn log_out(&self) {}
    async fn abort(&self) {}

    async fn delete_user(&self, _id_token: &str) -> DeleteOutcome {
        DeleteOutcome { success: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(mins_from_epoch: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(mins_from_epoch * 60, 0).unwrap()
    }

    #[test]
    fn empty_refresh_token_forces_full_sign_in() {
        let decision = refresh_decision(ts(0), ts(100), "");
        assert_eq!(decision, RefreshDecision::FullSignIn);
    }

    #[test]
    fn refresh_fires_one_minute_before_expiry() {
        let expires_at = ts(100);
        assert_eq!(
            refresh_decision(ts(98), expires_at, "tok"),
            RefreshDecision::Wait
        );
        assert_eq!(
            refresh_decision(ts(99), expires_at, "tok"),
            RefreshDecision::Refresh
        );
    }
}
