use crate::entities;
use crate::errors::AppError;
use crate::settings::Database as DbCfg;
use base64ct::Encoding;
use chrono::Utc;
use migration::MigratorTrait;
use rand::RngCore;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub subject: String,
    pub username: String,
    pub name: Option<String>,
    pub password_hash: String,
    pub is_admin: i64,
    pub enabled: i64,
    pub created_at: i64,
}

impl From<entities::user::Model> for User {
    fn from(model: entities::user::Model) -> Self {
        Self {
            subject: model.subject,
            username: model.username,
            name: model.name,
            password_hash: model.password_hash,
            is_admin: model.is_admin,
            enabled: model.enabled,
            created_at: model.created_at,
        }
    }
}

/// Approver browser session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub subject: String,
    pub auth_time: i64,
    pub created_at: i64,
    pub expires_at: i64,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl From<entities::session::Model> for Session {
    fn from(model: entities::session::Model) -> Self {
        Self {
            session_id: model.session_id,
            subject: model.subject,
            auth_time: model.auth_time,
            created_at: model.created_at,
            expires_at: model.expires_at,
            user_agent: model.user_agent,
            ip_address: model.ip_address,
        }
    }
}

/// Connect and bring the schema up to date.
pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, AppError> {
    let db = Database::connect(&cfg.url).await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

pub(crate) fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

// User management functions

pub async fn create_user(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
    name: Option<String>,
    is_admin: bool,
) -> Result<User, AppError> {
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::{Argon2, PasswordHasher};

    let subject = random_id();
    let created_at = Utc::now().timestamp();

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::Other(format!("Password hashing failed: {}", e)))?
        .to_string();

    let user = entities::user::ActiveModel {
        subject: Set(subject),
        username: Set(username.to_string()),
        name: Set(name),
        password_hash: Set(password_hash),
        is_admin: Set(is_admin as i64),
        enabled: Set(1),
        created_at: Set(created_at),
    };

    Ok(user.insert(db).await?.into())
}

pub async fn get_user_by_username(
    db: &DatabaseConnection,
    username: &str,
) -> Result<Option<User>, AppError> {
    use entities::user::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::Username.eq(username))
        .one(db)
        .await?
        .map(User::from))
}

pub async fn get_user_by_subject(
    db: &DatabaseConnection,
    subject: &str,
) -> Result<Option<User>, AppError> {
    use entities::user::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::Subject.eq(subject))
        .one(db)
        .await?
        .map(User::from))
}

/// Returns the subject on success. Disabled users never verify.
pub async fn verify_user_password(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
) -> Result<Option<String>, AppError> {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};

    let user = match get_user_by_username(db, username).await? {
        Some(u) if u.enabled == 1 => u,
        _ => return Ok(None),
    };

    let parsed_hash = PasswordHash::new(&user.password_hash)
        .map_err(|e| AppError::Other(format!("Invalid password hash: {}", e)))?;

    if Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
    {
        Ok(Some(user.subject))
    } else {
        Ok(None)
    }
}

pub async fn set_user_enabled(
    db: &DatabaseConnection,
    subject: &str,
    enabled: bool,
) -> Result<(), AppError> {
    use entities::user::{Column, Entity};

    let user = Entity::find()
        .filter(Column::Subject.eq(subject))
        .one(db)
        .await?
        .ok_or_else(|| AppError::Other(format!("User not found: {}", subject)))?;

    let mut active: entities::user::ActiveModel = user.into();
    active.enabled = Set(enabled as i64);
    active.update(db).await?;

    Ok(())
}

// Session management functions

pub async fn create_session(
    db: &DatabaseConnection,
    subject: &str,
    auth_time: i64,
    ttl_secs: i64,
    user_agent: Option<String>,
    ip_address: Option<String>,
) -> Result<Session, AppError> {
    let session = entities::session::ActiveModel {
        session_id: Set(random_id()),
        subject: Set(subject.to_string()),
        auth_time: Set(auth_time),
        created_at: Set(Utc::now().timestamp()),
        expires_at: Set(auth_time + ttl_secs),
        user_agent: Set(user_agent),
        ip_address: Set(ip_address),
    };

    Ok(session.insert(db).await?.into())
}

/// Expired sessions read as absent.
pub async fn get_session(
    db: &DatabaseConnection,
    session_id: &str,
) -> Result<Option<Session>, AppError> {
    use entities::session::{Column, Entity};

    let now = Utc::now().timestamp();
    Ok(Entity::find()
        .filter(Column::SessionId.eq(session_id))
        .one(db)
        .await?
        .filter(|model| now <= model.expires_at)
        .map(Session::from))
}

pub async fn delete_session(db: &DatabaseConnection, session_id: &str) -> Result<(), AppError> {
    use entities::session::{Column, Entity};

    Entity::delete_many()
        .filter(Column::SessionId.eq(session_id))
        .exec(db)
        .await?;

    Ok(())
}

pub async fn cleanup_expired_sessions(db: &DatabaseConnection) -> Result<u64, AppError> {
    use entities::session::{Column, Entity};

    let now = Utc::now().timestamp();
    let result = Entity::delete_many()
        .filter(Column::ExpiresAt.lt(now))
        .exec(db)
        .await?;

    Ok(result.rows_affected)
}
