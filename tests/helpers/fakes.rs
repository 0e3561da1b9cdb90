use async_trait::async_trait;
use pairgate::device_auth::{DeviceAuthError, Identity, IssuedCredentials, TokenIssuer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Issues predictable tokens and counts how many were handed out.
#[derive(Clone, Default)]
pub struct CountingTokenIssuer {
    issued: Arc<AtomicUsize>,
}

impl CountingTokenIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenIssuer for CountingTokenIssuer {
    async fn issue(&self, identity: &Identity) -> Result<IssuedCredentials, DeviceAuthError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(IssuedCredentials {
            token: format!("token-{}-{}", identity.id, n),
            secondary: None,
        })
    }
}
