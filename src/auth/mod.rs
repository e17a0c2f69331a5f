//! Authentication Module
//! Mission: Credential issuance, session revocation and the request auth gate

pub mod api;
pub mod cookies;
pub mod gate;
pub mod jwt;
pub mod middleware;
pub mod models;
pub mod session_store;
pub mod user_store;

pub use api::{AuthState, LogNotifier, VerificationNotifier};
pub use gate::{AuthGate, GateOutcome};
pub use jwt::{CredentialKind, TokenIssuer};
pub use middleware::auth_middleware;
pub use session_store::{MemorySessionStore, SessionStore, SqliteSessionStore, StoreError};
pub use user_store::AccountStore;
