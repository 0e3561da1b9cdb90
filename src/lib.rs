//! Pairgate - device authorization for cross-device login
//!
//! A device without a keyboard asks for a pair of codes, shows one of them as
//! a QR code, and polls until a signed-in user approves it from another device.
//! All modules are public so integration tests can drive them directly.

pub mod device_auth;
pub mod entities;
pub mod errors;
pub mod jobs;
pub mod jwks;
pub mod session;
pub mod settings;
pub mod storage;
pub mod web;
