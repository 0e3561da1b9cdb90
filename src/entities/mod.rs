pub mod device_auth;
pub mod job_execution;
pub mod session;
pub mod user;

pub use device_auth::Entity as DeviceAuth;
pub use job_execution::Entity as JobExecution;
pub use session::Entity as Session;
pub use user::Entity as User;
