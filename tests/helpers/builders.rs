use pairgate::storage;
use sea_orm::DatabaseConnection;

/// Builder for creating test users
pub struct UserBuilder {
    username: String,
    password: String,
    name: Option<String>,
    is_admin: bool,
    enabled: bool,
}

impl UserBuilder {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            password: "password123".to_string(),
            name: None,
            is_admin: false,
            enabled: true,
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> storage::User {
        let user = storage::create_user(db, &self.username, &self.password, self.name, self.is_admin)
            .await
            .expect("Failed to create test user");

        if self.enabled {
            return user;
        }

        storage::set_user_enabled(db, &user.subject, false)
            .await
            .expect("Failed to disable test user");
        storage::get_user_by_subject(db, &user.subject)
            .await
            .expect("Failed to get updated user")
            .expect("User not found")
    }
}

/// Builder for creating approver sessions
pub struct SessionBuilder {
    subject: String,
    auth_time: i64,
    ttl: i64,
}

impl SessionBuilder {
    pub fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            auth_time: chrono::Utc::now().timestamp(),
            ttl: 3600, // 1 hour
        }
    }

    pub fn with_auth_time(mut self, auth_time: i64) -> Self {
        self.auth_time = auth_time;
        self
    }

    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> storage::Session {
        storage::create_session(db, &self.subject, self.auth_time, self.ttl, None, None)
            .await
            .expect("Failed to create test session")
    }
}
