use super::store::{
    DeviceAuthRequest, DeviceAuthStatus, DeviceAuthStore, StatusTransition, StoreError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-process store keyed by device code.
///
/// Each operation runs under a single lock acquisition, which is what makes
/// `compare_and_set_status` atomic here.
#[derive(Clone, Default)]
pub struct MemoryDeviceAuthStore {
    requests: Arc<RwLock<HashMap<String, DeviceAuthRequest>>>,
}

impl MemoryDeviceAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.requests.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.requests.read().await.is_empty()
    }
}

#[async_trait]
impl DeviceAuthStore for MemoryDeviceAuthStore {
    async fn put(&self, request: &DeviceAuthRequest) -> Result<(), StoreError> {
        let mut requests = self.requests.write().await;

        let user_code_taken = requests.values().any(|existing| {
            existing.status == DeviceAuthStatus::Pending && existing.user_code == request.user_code
        });
        if user_code_taken || requests.contains_key(&request.device_code) {
            return Err(StoreError::Collision);
        }

        requests.insert(request.device_code.clone(), request.clone());
        Ok(())
    }

    async fn get_by_device_code(
        &self,
        device_code: &str,
    ) -> Result<Option<DeviceAuthRequest>, StoreError> {
        Ok(self.requests.read().await.get(device_code).cloned())
    }

    async fn get_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<DeviceAuthRequest>, StoreError> {
        Ok(self
            .requests
            .read()
            .await
            .values()
            .filter(|r| r.user_code == user_code)
            .max_by_key(|r| (r.status == DeviceAuthStatus::Pending, r.created_at))
            .cloned())
    }

    async fn compare_and_set_status(
        &self,
        device_code: &str,
        transition: StatusTransition,
    ) -> Result<(), StoreError> {
        let mut requests = self.requests.write().await;
        let current = requests.get_mut(device_code).ok_or(StoreError::NotFound)?;

        if current.status != transition.expected {
            return Err(StoreError::StatusMismatch {
                expected: transition.expected,
                actual: current.status,
            });
        }

        current.status = transition.new;
        if transition.user_id.is_some() {
            current.user_id = transition.user_id;
        }
        if transition.granted_at.is_some() {
            current.granted_at = transition.granted_at;
        }
        Ok(())
    }

    async fn consume_granted(&self, device_code: &str) -> Result<bool, StoreError> {
        let mut requests = self.requests.write().await;
        match requests.get(device_code) {
            Some(r) if r.status == DeviceAuthStatus::Granted => {
                requests.remove(device_code);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_expired(&self, now: i64) -> Result<u64, StoreError> {
        let mut requests = self.requests.write().await;
        let before = requests.len();
        requests.retain(|_, r| r.expires_at >= now);
        Ok((before - requests.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(device_code: &str, user_code: &str, created_at: i64) -> DeviceAuthRequest {
        DeviceAuthRequest {
            device_code: device_code.to_string(),
            user_code: user_code.to_string(),
            user_id: None,
            status: DeviceAuthStatus::Pending,
            client_ip: "10.0.0.1".to_string(),
            user_agent: "TV".to_string(),
            created_at,
            expires_at: created_at + 600,
            granted_at: None,
        }
    }

    #[tokio::test]
    async fn test_put_rejects_duplicate_device_code() {
        let store = MemoryDeviceAuthStore::new();
        store.put(&pending("dev1", "aaaa1111", 0)).await.unwrap();

        let result = store.put(&pending("dev1", "bbbb2222", 0)).await;
        assert!(matches!(result, Err(StoreError::Collision)));
    }

    #[tokio::test]
    async fn test_user_code_reusable_once_no_longer_pending() {
        let store = MemoryDeviceAuthStore::new();
        store.put(&pending("dev1", "aaaa1111", 0)).await.unwrap();

        assert!(matches!(
            store.put(&pending("dev2", "aaaa1111", 1)).await,
            Err(StoreError::Collision)
        ));

        store
            .compare_and_set_status("dev1", StatusTransition::deny())
            .await
            .unwrap();
        store.put(&pending("dev2", "aaaa1111", 1)).await.unwrap();

        let found = store.get_by_user_code("aaaa1111").await.unwrap().unwrap();
        assert_eq!(found.device_code, "dev2");
    }

    #[tokio::test]
    async fn test_user_code_reused_within_same_second_finds_pending() {
        let store = MemoryDeviceAuthStore::new();

        for round in 0..50 {
            let old = format!("old{round}");
            let new = format!("new{round}");
            let code = format!("{round:08x}");
            store.put(&pending(&old, &code, 100)).await.unwrap();
            store
                .compare_and_set_status(&old, StatusTransition::deny())
                .await
                .unwrap();
            store.put(&pending(&new, &code, 100)).await.unwrap();

            let found = store.get_by_user_code(&code).await.unwrap().unwrap();
            assert_eq!(found.device_code, new);
            assert_eq!(found.status, DeviceAuthStatus::Pending);
        }
    }

    #[tokio::test]
    async fn test_compare_and_set_reports_mismatch() {
        let store = MemoryDeviceAuthStore::new();
        store.put(&pending("dev1", "aaaa1111", 0)).await.unwrap();

        store
            .compare_and_set_status("dev1", StatusTransition::grant("user-1", 10))
            .await
            .unwrap();

        let second = store
            .compare_and_set_status("dev1", StatusTransition::deny())
            .await;
        assert!(matches!(
            second,
            Err(StoreError::StatusMismatch {
                actual: DeviceAuthStatus::Granted,
                ..
            })
        ));

        let missing = store
            .compare_and_set_status("nope", StatusTransition::deny())
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_consume_only_granted() {
        let store = MemoryDeviceAuthStore::new();
        store.put(&pending("dev1", "aaaa1111", 0)).await.unwrap();

        assert!(!store.consume_granted("dev1").await.unwrap());

        store
            .compare_and_set_status("dev1", StatusTransition::grant("user-1", 10))
            .await
            .unwrap();
        assert!(store.consume_granted("dev1").await.unwrap());
        assert!(!store.consume_granted("dev1").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_delete_expired_keeps_live_requests() {
        let store = MemoryDeviceAuthStore::new();
        store.put(&pending("old", "aaaa1111", 0)).await.unwrap();
        store.put(&pending("new", "bbbb2222", 500)).await.unwrap();

        // old expires at 600, new at 1100
        assert_eq!(store.delete_expired(600).await.unwrap(), 0);
        assert_eq!(store.delete_expired(601).await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
        assert!(store.get_by_device_code("new").await.unwrap().is_some());
    }
}
