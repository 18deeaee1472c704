use crate::services::challenge::ChallengeResponder;
use russh::keys::PrivateKey;
use std::fmt;
use std::sync::Arc;

/// SSH user authentication method
///
/// Exactly one is chosen per run; there is no fallback to the other.
pub enum AuthMethod {
    /// Public key authentication with an already decoded private key
    PublicKey(PrivateKey),
    /// Keyboard-interactive authentication answered by a responder
    KeyboardInteractive(Arc<dyn ChallengeResponder>),
}

impl AuthMethod {
    /// SSH method name as used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::PublicKey(_) => "publickey",
            Self::KeyboardInteractive(_) => "keyboard-interactive",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublicKey(key) => f
                .debug_tuple("PublicKey")
                .field(&key.algorithm().as_str())
                .finish(),
            Self::KeyboardInteractive(responder) => f
                .debug_tuple("KeyboardInteractive")
                .field(&responder.name())
                .finish(),
        }
    }
}
