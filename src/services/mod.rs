pub mod authenticator;
pub mod clients;
pub mod codes;
pub mod consent;
pub mod permission;
pub mod rate_limit;
pub mod tokens;

pub use authenticator::{Authenticator, SessionArtifact};
pub use clients::{ClientCredentials, ClientRegistry};
pub use codes::{CodeEngine, ConsumedCode};
pub use consent::ConsentLedger;
pub use permission::PermissionService;
pub use rate_limit::{LoginRateLimiter, RateLimitConfig};
pub use tokens::{Introspection, TokenEngine, TokenGrant};
