//! The device authorization state machine.
//!
//! ```text
//!             grant            poll (consumes)
//!   Pending ---------> Granted ---------------> (deleted)
//!      |
//!      +-------------> Denied
//!             deny
//! ```
//!
//! Expired is not a stored state: every read compares `expires_at` with the
//! clock first, and an expired request reads as expired whatever its status.

use super::clock::{Clock, SystemClock};
use super::codes::{
    format_user_code, validate_user_code, CodeGenerator, OsCodeGenerator, USER_CODE_BYTES,
};
use super::error::DeviceAuthError;
use super::issuer::{Identity, IdentityResolver, IssuedCredentials, TokenIssuer};
use super::store::{
    DeviceAuthRequest, DeviceAuthStatus, DeviceAuthStore, StatusTransition, StoreError,
};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DeviceAuthConfig {
    pub ttl_secs: i64,
    pub poll_interval_secs: i64,
    pub max_code_attempts: u32,
    /// Length of a canonical user code in hex characters
    pub user_code_len: usize,
    /// Public origin of the approval page, without a trailing slash
    pub base_url: String,
    pub verification_path: String,
    pub opportunistic_cleanup: bool,
}

impl DeviceAuthConfig {
    /// Absolute URL of the approval page.
    pub fn verification_url(&self) -> String {
        self.verification_url_at(&self.base_url)
    }

    fn verification_url_at(&self, base_url: &str) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), self.verification_path)
    }
}

impl Default for DeviceAuthConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            poll_interval_secs: 3,
            max_code_attempts: 5,
            user_code_len: 2 * USER_CODE_BYTES,
            base_url: "http://localhost:8080".to_string(),
            verification_path: "/app/#/device/grant".to_string(),
            opportunistic_cleanup: true,
        }
    }
}

/// Where a request came from, shown to the approver.
#[derive(Debug, Clone, Default)]
pub struct Provenance {
    pub client_ip: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceAuthStart {
    pub device_code: String,
    /// Display form, `XXXX-XXXX`
    pub user_code: String,
    pub verification_url: String,
    pub qr_data: String,
    pub expires_in: i64,
    pub interval: i64,
}

#[derive(Debug, Clone)]
pub struct GrantedSession {
    pub identity: Identity,
    pub credentials: IssuedCredentials,
}

#[derive(Debug, Clone)]
pub enum PollOutcome {
    Pending,
    Denied,
    Expired,
    Granted(GrantedSession),
}

impl PollOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            PollOutcome::Pending => "pending",
            PollOutcome::Denied => "denied",
            PollOutcome::Expired => "expired",
            PollOutcome::Granted(_) => "granted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    /// Display form, `XXXX-XXXX`
    pub user_code: String,
    pub client_ip: String,
    pub user_agent: String,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Expired,
    Granted,
    Denied,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidReason::Expired => "expired",
            InvalidReason::Granted => "granted",
            InvalidReason::Denied => "denied",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            InvalidReason::Expired => "This code has expired",
            InvalidReason::Granted | InvalidReason::Denied => "This code has already been used",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoOutcome {
    Valid(PendingInfo),
    Invalid(InvalidReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalAction {
    Grant,
    Deny,
}

impl FromStr for ApprovalAction {
    type Err = DeviceAuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grant" => Ok(ApprovalAction::Grant),
            "deny" => Ok(ApprovalAction::Deny),
            _ => Err(DeviceAuthError::InvalidInput(
                "action must be 'grant' or 'deny'".to_string(),
            )),
        }
    }
}

#[derive(Clone)]
pub struct DeviceAuthService {
    config: DeviceAuthConfig,
    store: Arc<dyn DeviceAuthStore>,
    identities: Arc<dyn IdentityResolver>,
    issuer: Arc<dyn TokenIssuer>,
    codes: Arc<dyn CodeGenerator>,
    clock: Arc<dyn Clock>,
}

impl DeviceAuthService {
    pub fn new(
        config: DeviceAuthConfig,
        store: Arc<dyn DeviceAuthStore>,
        identities: Arc<dyn IdentityResolver>,
        issuer: Arc<dyn TokenIssuer>,
    ) -> Self {
        Self {
            config,
            store,
            identities,
            issuer,
            codes: Arc::new(OsCodeGenerator::default()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_code_generator(mut self, codes: Arc<dyn CodeGenerator>) -> Self {
        self.codes = codes;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &DeviceAuthConfig {
        &self.config
    }

    /// Open a new pending request for an unauthenticated device.
    pub async fn start(&self, provenance: Provenance) -> Result<DeviceAuthStart, DeviceAuthError> {
        let verification_url = self.config.verification_url();
        self.open(provenance, verification_url).await
    }

    /// Like [`start`](Self::start), but the approval page is addressed from
    /// `base_url`, the origin the device itself reached us on.
    pub async fn start_for_base(
        &self,
        provenance: Provenance,
        base_url: &str,
    ) -> Result<DeviceAuthStart, DeviceAuthError> {
        let verification_url = self.config.verification_url_at(base_url);
        self.open(provenance, verification_url).await
    }

    async fn open(
        &self,
        provenance: Provenance,
        verification_url: String,
    ) -> Result<DeviceAuthStart, DeviceAuthError> {
        let now = self.clock.now();

        for attempt in 1..=self.config.max_code_attempts {
            let request = DeviceAuthRequest {
                device_code: self.codes.new_device_code()?,
                user_code: self.codes.new_user_code()?,
                user_id: None,
                status: DeviceAuthStatus::Pending,
                client_ip: provenance.client_ip.clone(),
                user_agent: provenance.user_agent.clone(),
                created_at: now,
                expires_at: now + self.config.ttl_secs,
                granted_at: None,
            };

            match self.store.put(&request).await {
                Ok(()) => {
                    debug!(
                        client_ip = %request.client_ip,
                        user_code = %request.user_code,
                        "Device authorization started"
                    );
                    return Ok(self.start_response(&request, verification_url));
                }
                Err(StoreError::Collision) => {
                    warn!(attempt, "Device authorization code collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        error!(
            attempts = self.config.max_code_attempts,
            "Could not allocate a unique device authorization code"
        );
        Err(DeviceAuthError::Internal(
            "could not allocate a unique code".to_string(),
        ))
    }

    fn start_response(
        &self,
        request: &DeviceAuthRequest,
        verification_url: String,
    ) -> DeviceAuthStart {
        let user_code = format_user_code(&request.user_code);
        let qr_data = format!("{verification_url}?code={user_code}");
        DeviceAuthStart {
            device_code: request.device_code.clone(),
            user_code,
            verification_url,
            qr_data,
            expires_in: self.config.ttl_secs,
            interval: self.config.poll_interval_secs,
        }
    }

    /// Device-side status check. Read-only unless the request was granted, in
    /// which case the request is consumed and credentials are handed out once.
    pub async fn poll(&self, device_code: &str) -> Result<PollOutcome, DeviceAuthError> {
        if device_code.trim().is_empty() {
            return Err(DeviceAuthError::InvalidInput(
                "device_code is required".to_string(),
            ));
        }

        let request = self
            .store
            .get_by_device_code(device_code)
            .await?
            .ok_or(DeviceAuthError::NotFound)?;

        if request.is_expired(self.clock.now()) {
            return Ok(PollOutcome::Expired);
        }

        match request.status {
            DeviceAuthStatus::Pending => Ok(PollOutcome::Pending),
            DeviceAuthStatus::Denied => Ok(PollOutcome::Denied),
            DeviceAuthStatus::Granted => self.complete_grant(request).await,
        }
    }

    async fn complete_grant(
        &self,
        request: DeviceAuthRequest,
    ) -> Result<PollOutcome, DeviceAuthError> {
        let user_id = request.user_id.as_deref().ok_or_else(|| {
            error!("Granted device authorization has no user");
            DeviceAuthError::Internal("granted request has no user".to_string())
        })?;

        let identity = self.identities.resolve(user_id).await?.ok_or_else(|| {
            error!(user_id, "User of a granted device authorization is gone");
            DeviceAuthError::Internal("granting user no longer exists".to_string())
        })?;

        let credentials = self.issuer.issue(&identity).await.inspect_err(|e| {
            error!(error = %e, "Failed to issue device session");
        })?;

        // Single use: only the poll that deletes the record delivers credentials
        if !self.store.consume_granted(&request.device_code).await? {
            debug!("Granted device authorization already consumed");
            return Err(DeviceAuthError::NotFound);
        }

        info!(
            user = %identity.username,
            client_ip = %request.client_ip,
            has_secondary = credentials.secondary.is_some(),
            "Device authorization completed"
        );

        if self.config.opportunistic_cleanup {
            if let Err(e) = self.cleanup().await {
                warn!(error = %e, "Opportunistic device authorization cleanup failed");
            }
        }

        Ok(PollOutcome::Granted(GrantedSession {
            identity,
            credentials,
        }))
    }

    /// Approver-side preview of a request. Never mutates.
    pub async fn info(&self, user_code: &str) -> Result<InfoOutcome, DeviceAuthError> {
        let code = validate_user_code(user_code, self.config.user_code_len)?;
        let request = self
            .store
            .get_by_user_code(&code)
            .await?
            .ok_or(DeviceAuthError::NotFound)?;

        if request.is_expired(self.clock.now()) {
            return Ok(InfoOutcome::Invalid(InvalidReason::Expired));
        }

        Ok(match request.status {
            DeviceAuthStatus::Pending => InfoOutcome::Valid(PendingInfo {
                user_code: format_user_code(&request.user_code),
                client_ip: request.client_ip,
                user_agent: request.user_agent,
                created_at: request.created_at,
                expires_at: request.expires_at,
            }),
            DeviceAuthStatus::Granted => InfoOutcome::Invalid(InvalidReason::Granted),
            DeviceAuthStatus::Denied => InfoOutcome::Invalid(InvalidReason::Denied),
        })
    }

    /// Resolve a pending request on behalf of an authenticated approver.
    pub async fn grant_or_deny(
        &self,
        user_code: &str,
        approver_user_id: &str,
        action: ApprovalAction,
    ) -> Result<(), DeviceAuthError> {
        if approver_user_id.trim().is_empty() {
            return Err(DeviceAuthError::Unauthenticated);
        }
        let code = validate_user_code(user_code, self.config.user_code_len)?;

        let request = self
            .store
            .get_by_user_code(&code)
            .await?
            .ok_or(DeviceAuthError::NotFound)?;

        let now = self.clock.now();
        if request.is_expired(now) {
            return Err(DeviceAuthError::Expired);
        }
        if request.status != DeviceAuthStatus::Pending {
            return Err(DeviceAuthError::Conflict);
        }

        let transition = match action {
            ApprovalAction::Grant => StatusTransition::grant(approver_user_id, now),
            ApprovalAction::Deny => StatusTransition::deny(),
        };

        match self
            .store
            .compare_and_set_status(&request.device_code, transition)
            .await
        {
            Ok(()) => {
                info!(
                    action = ?action,
                    approver = approver_user_id,
                    client_ip = %request.client_ip,
                    "Device authorization updated"
                );
                Ok(())
            }
            Err(StoreError::StatusMismatch { actual, .. }) => {
                debug!(%actual, "Device authorization transitioned concurrently");
                Err(DeviceAuthError::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every expired request. Idempotent.
    pub async fn cleanup(&self) -> Result<u64, DeviceAuthError> {
        let removed = self.store.delete_expired(self.clock.now()).await?;
        if removed > 0 {
            info!(removed, "Removed expired device authorizations");
        }
        Ok(removed)
    }
}
