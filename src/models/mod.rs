pub mod auth;
pub mod destination;
pub mod proxy;
pub mod session;

// Re-export main types
pub use auth::AuthMethod;
pub use destination::Destination;
pub use proxy::{ProxyCredentials, ProxyEndpoint, ProxyScheme};
pub use session::{SessionConfig, SessionState};
