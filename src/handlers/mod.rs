pub mod auth;
pub mod authorize;
pub mod oidc;
pub mod token;
