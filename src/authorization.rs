//! One-time display mirroring grants.
//!
//! The OS permission broker answers a request with a `(grant_code, payload)`
//! pair. A successful answer becomes a [`CaptureCredential`], which can be
//! redeemed into exactly one mirroring session.

use crate::error::CaptureError;
use crate::permissions::{
    ScreenRecordingStatus, request_screen_recording_access, screen_recording_status,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Grant code the broker uses for an approved request.
pub const GRANT_OK: i32 = -1;
/// Grant code for a dismissed or refused request.
pub const GRANT_CANCELED: i32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionResponse {
    pub grant_code: i32,
    pub grant_payload: Option<Vec<u8>>,
}

impl PermissionResponse {
    pub fn granted(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            grant_code: GRANT_OK,
            grant_payload: Some(payload.into()),
        }
    }

    pub fn canceled() -> Self {
        Self {
            grant_code: GRANT_CANCELED,
            grant_payload: None,
        }
    }
}

/// The OS permission UI. Calling `request` hands control to the user and
/// resumes once they answer.
#[async_trait]
pub trait PermissionPrompt: Send + Sync {
    async fn request(&self) -> Result<PermissionResponse>;
}

#[derive(Debug, Default)]
struct GrantState {
    redeemed: AtomicBool,
    revoked: AtomicBool,
}

/// OS-issued token authorizing one mirroring session. Clones share the same
/// grant, so redeeming any clone spends all of them.
#[derive(Clone)]
pub struct CaptureCredential {
    grant_code: i32,
    grant_payload: Arc<[u8]>,
    state: Arc<GrantState>,
}

impl CaptureCredential {
    /// Returns `None` unless the response carries [`GRANT_OK`] and a payload.
    pub fn from_response(response: PermissionResponse) -> Option<Self> {
        if response.grant_code != GRANT_OK {
            return None;
        }
        let payload = response.grant_payload?;
        Some(Self {
            grant_code: response.grant_code,
            grant_payload: payload.into(),
            state: Arc::new(GrantState::default()),
        })
    }

    pub fn grant_code(&self) -> i32 {
        self.grant_code
    }

    pub fn grant_payload(&self) -> &[u8] {
        &self.grant_payload
    }

    pub fn is_redeemed(&self) -> bool {
        self.state.redeemed.load(Ordering::SeqCst)
    }

    pub fn is_revoked(&self) -> bool {
        self.state.revoked.load(Ordering::SeqCst)
    }

    pub fn is_spent(&self) -> bool {
        self.is_redeemed() || self.is_revoked()
    }

    pub fn revoke(&self) {
        self.state.revoked.store(true, Ordering::SeqCst);
    }

    /// Marks the grant as used. Fails if it was revoked or already redeemed.
    pub fn redeem(&self) -> Result<(), CaptureError> {
        if self.is_revoked() {
            return Err(CaptureError::unavailable("capture grant was revoked"));
        }
        if self.state.redeemed.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::unavailable(
                "capture grant was already redeemed",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for CaptureCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureCredential")
            .field("grant_code", &self.grant_code)
            .field("payload_len", &self.grant_payload.len())
            .field("redeemed", &self.is_redeemed())
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum PermissionOutcome {
    Granted(CaptureCredential),
    Denied,
}

impl PermissionOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionOutcome::Granted(_))
    }
}

/// Turns user approvals into credentials and remembers the unspent one.
pub struct AuthorizationBroker {
    prompt: Arc<dyn PermissionPrompt>,
    active: Mutex<Option<CaptureCredential>>,
}

impl AuthorizationBroker {
    pub fn new(prompt: Arc<dyn PermissionPrompt>) -> Self {
        Self {
            prompt,
            active: Mutex::new(None),
        }
    }

    /// Returns the held credential if it can still be redeemed; otherwise asks
    /// the user. Denial is an outcome, never an error.
    pub async fn request_capture_permission(&self) -> PermissionOutcome {
        if let Some(credential) = self.active_credential() {
            log::debug!("reusing active capture grant");
            return PermissionOutcome::Granted(credential);
        }

        let response = match self.prompt.request().await {
            Ok(response) => response,
            Err(err) => {
                log::warn!("permission prompt failed: {err:#}");
                return PermissionOutcome::Denied;
            }
        };

        match CaptureCredential::from_response(response) {
            Some(credential) => {
                self.adopt(credential.clone());
                PermissionOutcome::Granted(credential)
            }
            None => {
                log::info!("screen capture permission denied");
                PermissionOutcome::Denied
            }
        }
    }

    /// Holds a credential obtained elsewhere, e.g. passed in with a start command.
    pub fn adopt(&self, credential: CaptureCredential) {
        *self.active.lock().expect("capture grant mutex poisoned") = Some(credential);
    }

    pub fn active_credential(&self) -> Option<CaptureCredential> {
        let mut active = self.active.lock().expect("capture grant mutex poisoned");
        if active.as_ref().is_some_and(CaptureCredential::is_spent) {
            *active = None;
        }
        active.clone()
    }

    pub fn has_active_grant(&self) -> bool {
        self.active_credential().is_some()
    }

    /// The OS withdrew the grant; any outstanding clone can no longer be redeemed.
    pub fn revoke(&self) {
        if let Some(credential) = self
            .active
            .lock()
            .expect("capture grant mutex poisoned")
            .take()
        {
            credential.revoke();
            log::info!("capture grant revoked");
        }
    }
}

/// Uses the CoreGraphics screen recording permission. Hosts that have no such
/// permission grant every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct MacOsPermissionPrompt;

#[async_trait]
impl PermissionPrompt for MacOsPermissionPrompt {
    async fn request(&self) -> Result<PermissionResponse> {
        let status = match screen_recording_status() {
            ScreenRecordingStatus::Denied => {
                tokio::task::spawn_blocking(request_screen_recording_access)
                    .await
                    .context("screen recording permission request panicked")?
            }
            status => status,
        };

        if status.is_granted() {
            let token = format!("screen-recording:{}", std::process::id());
            Ok(PermissionResponse::granted(token.into_bytes()))
        } else {
            Ok(PermissionResponse::canceled())
        }
    }
}

/// Answers every request the same way and counts how often it was asked.
#[derive(Debug, Default)]
pub struct StaticPermissionPrompt {
    deny: bool,
    prompts: AtomicUsize,
}

impl StaticPermissionPrompt {
    pub fn granting() -> Self {
        Self::default()
    }

    pub fn denying() -> Self {
        Self {
            deny: true,
            prompts: AtomicUsize::new(0),
        }
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionPrompt for StaticPermissionPrompt {
    async fn request(&self) -> Result<PermissionResponse> {
        let count = self.prompts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.deny {
            Ok(PermissionResponse::canceled())
        } else {
            Ok(PermissionResponse::granted(format!("static-grant-{count}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AuthorizationBroker, CaptureCredential, GRANT_OK, PermissionOutcome, PermissionPrompt,
        PermissionResponse, StaticPermissionPrompt,
    };
    use crate::error::CaptureError;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use std::sync::Arc;

    #[test]
    fn credential_requires_ok_code_and_payload() {
        assert!(CaptureCredential::from_response(PermissionResponse::canceled()).is_none());
        assert!(
            CaptureCredential::from_response(PermissionResponse {
                grant_code: GRANT_OK,
                grant_payload: None,
            })
            .is_none()
        );
        assert!(
            CaptureCredential::from_response(PermissionResponse {
                grant_code: 7,
                grant_payload: Some(vec![1, 2, 3]),
            })
            .is_none()
        );
        let credential =
            CaptureCredential::from_response(PermissionResponse::granted(vec![9, 9]))
                .expect("valid grant");
        assert_eq!(credential.grant_payload(), &[9, 9]);
    }

    #[test]
    fn credential_redeems_once() {
        let credential = CaptureCredential::from_response(PermissionResponse::granted("token"))
            .expect("valid grant");
        let clone = credential.clone();
        credential.redeem().expect("first redemption");
        assert!(matches!(
            clone.redeem(),
            Err(CaptureError::ResourceUnavailable(_))
        ));
    }

    #[test]
    fn revoked_credential_cannot_be_redeemed() {
        let credential = CaptureCredential::from_response(PermissionResponse::granted("token"))
            .expect("valid grant");
        credential.revoke();
        let err = credential.redeem().expect_err("revoked grant");
        assert!(err.to_string().contains("revoked"));
    }

    #[tokio::test]
    async fn repeated_requests_reuse_the_active_grant() {
        let prompt = Arc::new(StaticPermissionPrompt::granting());
        let broker = AuthorizationBroker::new(prompt.clone());

        assert!(broker.request_capture_permission().await.is_granted());
        assert!(broker.request_capture_permission().await.is_granted());
        assert_eq!(prompt.prompts(), 1);
    }

    #[tokio::test]
    async fn spent_grant_prompts_again() {
        let prompt = Arc::new(StaticPermissionPrompt::granting());
        let broker = AuthorizationBroker::new(prompt.clone());

        let PermissionOutcome::Granted(credential) = broker.request_capture_permission().await
        else {
            panic!("expected grant");
        };
        credential.redeem().expect("redeem");
        assert!(!broker.has_active_grant());

        assert!(broker.request_capture_permission().await.is_granted());
        assert_eq!(prompt.prompts(), 2);
    }

    #[tokio::test]
    async fn denial_is_an_outcome() {
        let broker = AuthorizationBroker::new(Arc::new(StaticPermissionPrompt::denying()));
        assert!(matches!(
            broker.request_capture_permission().await,
            PermissionOutcome::Denied
        ));
        assert!(!broker.has_active_grant());
    }

    struct BrokenPrompt;

    #[async_trait]
    impl PermissionPrompt for BrokenPrompt {
        async fn request(&self) -> Result<PermissionResponse> {
            Err(anyhow!("no foreground activity to host the prompt"))
        }
    }

    #[tokio::test]
    async fn prompt_errors_are_treated_as_denial() {
        let broker = AuthorizationBroker::new(Arc::new(BrokenPrompt));
        assert!(!broker.request_capture_permission().await.is_granted());
    }

    #[tokio::test]
    async fn revoke_spends_outstanding_clones() {
        let broker = AuthorizationBroker::new(Arc::new(StaticPermissionPrompt::granting()));
        let PermissionOutcome::Granted(credential) = broker.request_capture_permission().await
        else {
            panic!("expected grant");
        };
        broker.revoke();
        assert!(credential.is_revoked());
        assert!(credential.redeem().is_err());
    }
}
