pub mod builders;
pub mod db;
pub mod fakes;

pub use builders::{SessionBuilder, UserBuilder};
pub use db::TestDb;
pub use fakes::CountingTokenIssuer;
