pub mod client;
pub mod code;
pub mod consent;
pub mod rbac;
pub mod token;
pub mod user;

pub use client::*;
pub use code::*;
pub use consent::*;
pub use rbac::*;
pub use token::*;
pub use user::*;
