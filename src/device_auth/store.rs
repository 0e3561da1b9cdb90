use crate::entities;
use async_trait::async_trait;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set, SqlErr,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Persisted status. Expiry is derived from `expires_at` and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAuthStatus {
    Pending,
    Granted,
    Denied,
}

impl DeviceAuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceAuthStatus::Pending => "pending",
            DeviceAuthStatus::Granted => "granted",
            DeviceAuthStatus::Denied => "denied",
        }
    }
}

impl fmt::Display for DeviceAuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceAuthStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeviceAuthStatus::Pending),
            "granted" => Ok(DeviceAuthStatus::Granted),
            "denied" => Ok(DeviceAuthStatus::Denied),
            other => Err(StoreError::Corrupt(format!("unknown status `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAuthRequest {
    pub device_code: String,
    /// Canonical form: lowercase, no separators
    pub user_code: String,
    /// Set if and only if status is `Granted`
    pub user_id: Option<String>,
    pub status: DeviceAuthStatus,
    pub client_ip: String,
    pub user_agent: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub granted_at: Option<i64>,
}

impl DeviceAuthRequest {
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

impl TryFrom<entities::device_auth::Model> for DeviceAuthRequest {
    type Error = StoreError;

    fn try_from(model: entities::device_auth::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            status: model.status.parse()?,
            device_code: model.device_code,
            user_code: model.user_code,
            user_id: model.user_id,
            client_ip: model.client_ip,
            user_agent: model.user_agent,
            created_at: model.created_at,
            expires_at: model.expires_at,
            granted_at: model.granted_at,
        })
    }
}

/// A conditional status change, applied only while the record is in `expected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub expected: DeviceAuthStatus,
    pub new: DeviceAuthStatus,
    pub user_id: Option<String>,
    pub granted_at: Option<i64>,
}

impl StatusTransition {
    pub fn grant(user_id: &str, granted_at: i64) -> Self {
        Self {
            expected: DeviceAuthStatus::Pending,
            new: DeviceAuthStatus::Granted,
            user_id: Some(user_id.to_string()),
            granted_at: Some(granted_at),
        }
    }

    pub fn deny() -> Self {
        Self {
            expected: DeviceAuthStatus::Pending,
            new: DeviceAuthStatus::Denied,
            user_id: None,
            granted_at: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("device code or pending user code already in use")]
    Collision,

    #[error("device authorization not found")]
    NotFound,

    #[error("device authorization is {actual}, expected {expected}")]
    StatusMismatch {
        expected: DeviceAuthStatus,
        actual: DeviceAuthStatus,
    },

    #[error("corrupt device authorization record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Db(#[from] DbErr),
}

/// Durable storage for device authorization requests.
///
/// Every status change goes through [`DeviceAuthStore::compare_and_set_status`];
/// implementations must apply it atomically.
#[async_trait]
pub trait DeviceAuthStore: Send + Sync {
    /// Insert a new request. Fails with `Collision` if the device code exists or
    /// the user code belongs to another pending request.
    async fn put(&self, request: &DeviceAuthRequest) -> Result<(), StoreError>;

    async fn get_by_device_code(
        &self,
        device_code: &str,
    ) -> Result<Option<DeviceAuthRequest>, StoreError>;

    /// The pending request carrying this canonical user code, else the newest.
    async fn get_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<DeviceAuthRequest>, StoreError>;

    /// Apply `transition` if the current status equals `transition.expected`.
    /// Fails with `NotFound` or `StatusMismatch`, never silently.
    async fn compare_and_set_status(
        &self,
        device_code: &str,
        transition: StatusTransition,
    ) -> Result<(), StoreError>;

    /// Delete a granted request. Returns false if it was not (or no longer) there.
    async fn consume_granted(&self, device_code: &str) -> Result<bool, StoreError>;

    /// Delete every request with `expires_at < now`.
    async fn delete_expired(&self, now: i64) -> Result<u64, StoreError>;
}

/// SQL-backed store over the `device_auth` table.
#[derive(Clone)]
pub struct SeaOrmDeviceAuthStore {
    db: DatabaseConnection,
}

impl SeaOrmDeviceAuthStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn map_insert_error(err: DbErr) -> StoreError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => StoreError::Collision,
        _ => StoreError::Db(err),
    }
}

#[async_trait]
impl DeviceAuthStore for SeaOrmDeviceAuthStore {
    async fn put(&self, request: &DeviceAuthRequest) -> Result<(), StoreError> {
        let model = entities::device_auth::ActiveModel {
            device_code: Set(request.device_code.clone()),
            user_code: Set(request.user_code.clone()),
            user_id: Set(request.user_id.clone()),
            status: Set(request.status.as_str().to_string()),
            client_ip: Set(request.client_ip.clone()),
            user_agent: Set(request.user_agent.clone()),
            created_at: Set(request.created_at),
            expires_at: Set(request.expires_at),
            granted_at: Set(request.granted_at),
        };

        model.insert(&self.db).await.map_err(map_insert_error)?;
        Ok(())
    }

    async fn get_by_device_code(
        &self,
        device_code: &str,
    ) -> Result<Option<DeviceAuthRequest>, StoreError> {
        use entities::device_auth::{Column, Entity};

        Entity::find()
            .filter(Column::DeviceCode.eq(device_code))
            .one(&self.db)
            .await?
            .map(DeviceAuthRequest::try_from)
            .transpose()
    }

    async fn get_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<DeviceAuthRequest>, StoreError> {
        use entities::device_auth::{Column, Entity};

        // At most one pending row per code; it wins over older rows created in
        // the same second
        let pending = Entity::find()
            .filter(Column::UserCode.eq(user_code))
            .filter(Column::Status.eq(DeviceAuthStatus::Pending.as_str()))
            .one(&self.db)
            .await?;
        let model = match pending {
            Some(model) => Some(model),
            None => {
                Entity::find()
                    .filter(Column::UserCode.eq(user_code))
                    .order_by_desc(Column::CreatedAt)
                    .one(&self.db)
                    .await?
            }
        };

        model.map(DeviceAuthRequest::try_from).transpose()
    }

    async fn compare_and_set_status(
        &self,
        device_code: &str,
        transition: StatusTransition,
    ) -> Result<(), StoreError> {
        use entities::device_auth::{Column, Entity};

        // Single UPDATE guarded on the expected status
        let mut update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(transition.new.as_str()))
            .filter(Column::DeviceCode.eq(device_code))
            .filter(Column::Status.eq(transition.expected.as_str()));
        if let Some(user_id) = &transition.user_id {
            update = update.col_expr(Column::UserId, Expr::value(user_id.clone()));
        }
        if let Some(granted_at) = transition.granted_at {
            update = update.col_expr(Column::GrantedAt, Expr::value(granted_at));
        }

        let result = update.exec(&self.db).await?;
        if result.rows_affected == 1 {
            return Ok(());
        }

        match self.get_by_device_code(device_code).await? {
            None => Err(StoreError::NotFound),
            Some(current) => Err(StoreError::StatusMismatch {
                expected: transition.expected,
                actual: current.status,
            }),
        }
    }

    async fn consume_granted(&self, device_code: &str) -> Result<bool, StoreError> {
        use entities::device_auth::{Column, Entity};

        let result = Entity::delete_many()
            .filter(Column::DeviceCode.eq(device_code))
            .filter(Column::Status.eq(DeviceAuthStatus::Granted.as_str()))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    async fn delete_expired(&self, now: i64) -> Result<u64, StoreError> {
        use entities::device_auth::{Column, Entity};

        let result = Entity::delete_many()
            .filter(Column::ExpiresAt.lt(now))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected)
    }
}
