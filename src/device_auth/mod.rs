//! Cross-device login: an unauthenticated device shows a code, an already
//! signed-in user approves it elsewhere, and the device picks up a session.

pub mod clock;
pub mod codes;
pub mod error;
pub mod issuer;
pub mod memory;
pub mod service;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codes::{format_user_code, normalize_user_code, CodeGenerator, OsCodeGenerator};
pub use error::DeviceAuthError;
pub use issuer::{
    DbIdentityResolver, Identity, IdentityResolver, IssuedCredentials, JwtTokenIssuer,
    SecondaryCredential, TokenIssuer,
};
pub use memory::MemoryDeviceAuthStore;
pub use service::{
    ApprovalAction, DeviceAuthConfig, DeviceAuthService, DeviceAuthStart, GrantedSession,
    InfoOutcome, InvalidReason, PendingInfo, PollOutcome, Provenance,
};
pub use store::{
    DeviceAuthRequest, DeviceAuthStatus, DeviceAuthStore, SeaOrmDeviceAuthStore,
    StatusTransition, StoreError,
};
