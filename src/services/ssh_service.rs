use crate::models::{AuthMethod, Destination};
use crate::services::challenge::{Challenge, ChallengePrompt, ChallengeResponder};
use crate::utils::error::{ProxySshError, Result};
use crate::utils::prompt::Prompter;
use russh::client::{self, AuthResult, Handle, KeyboardInteractiveAuthResponse, Msg};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, Disconnect};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// SSH client connection handle
pub type SshHandle = Handle<ClientHandler>;

/// Upper bound on keyboard-interactive rounds before giving up
const MAX_KBI_ROUNDS: usize = 16;

/// How the server's host key is judged
#[derive(Clone)]
pub enum HostKeyPolicy {
    /// Accept whatever key the server presents
    AcceptAny,
    /// Accept only the key with this SHA256 fingerprint
    Pinned(String),
    /// Show the fingerprint and ask the user
    Prompt(Arc<dyn Prompter>),
}

impl HostKeyPolicy {
    /// Decide whether to trust `fingerprint` for `destination`. Blocks when prompting.
    pub fn decide(&self, destination: &str, fingerprint: &str) -> std::io::Result<bool> {
        match self {
            Self::AcceptAny => {
                tracing::warn!(
                    "Host key verification disabled - accepting {} for {}",
                    fingerprint,
                    destination
                );
                Ok(true)
            }
            Self::Pinned(expected) => {
                let matches = normalize_fingerprint(expected) == normalize_fingerprint(fingerprint);
                if !matches {
                    tracing::error!("Server key mismatch for {}!", destination);
                    tracing::error!("Expected: {}", expected);
                    tracing::error!("Received: {}", fingerprint);
                }
                Ok(matches)
            }
            Self::Prompt(prompter) => prompter.confirm(&format!(
                "The authenticity of host '{}' can't be established.\nServer key fingerprint is {}.\nContinue connecting?",
                destination, fingerprint
            )),
        }
    }
}

impl fmt::Debug for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcceptAny => f.write_str("AcceptAny"),
            Self::Pinned(fp) => f.debug_tuple("Pinned").field(fp).finish(),
            Self::Prompt(_) => f.write_str("Prompt"),
        }
    }
}

fn normalize_fingerprint(fp: &str) -> &str {
    let fp = fp.trim();
    fp.strip_prefix("SHA256:").unwrap_or(fp)
}

/// Transport options for the SSH handshake
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub host_key_policy: HostKeyPolicy,
    /// Bound on establishing the SSH transport
    pub handshake_timeout: Option<Duration>,
    pub keepalive_interval: Option<Duration>,
}

impl SshOptions {
    pub fn new(host_key_policy: HostKeyPolicy) -> Self {
        Self {
            host_key_policy,
            handshake_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
        }
    }

    fn client_config(&self) -> client::Config {
        client::Config {
            // Interactive sessions may idle indefinitely
            inactivity_timeout: None,
            keepalive_interval: self.keepalive_interval,
            keepalive_max: 3,
            ..<client::Config as Default>::default()
        }
    }
}

/// Live, authenticated SSH connection
pub struct AuthenticatedConnection {
    handle: SshHandle,
    destination: Destination,
    user: String,
}

impl AuthenticatedConnection {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Open the session channel the shell will run on
    pub async fn open_session(&self) -> Result<Channel<Msg>> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| {
                ProxySshError::TransportError(format!("Failed to open session channel: {}", e))
            })
    }

    /// Disconnect from the SSH server
    pub async fn close(&self) -> Result<()> {
        if self.handle.is_closed() {
            return Ok(());
        }

        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| ProxySshError::TransportError(format!("Disconnect failed: {}", e)))?;

        tracing::info!("Disconnected from {}", self.destination);
        Ok(())
    }
}

/// SSH transport and user authentication
pub struct SshService;

impl SshService {
    /// Run the SSH handshake over `stream` and authenticate `user` with `method`.
    pub async fn authenticate<S>(
        stream: S,
        user: &str,
        method: AuthMethod,
        destination: &Destination,
        options: &SshOptions,
    ) -> Result<AuthenticatedConnection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        tracing::info!(
            "Connecting to {} as {} ({} auth)",
            destination,
            user,
            method.name()
        );

        let handler = ClientHandler::new(destination.to_string(), options.host_key_policy.clone());
        let config = Arc::new(options.client_config());

        let connect = client::connect_stream(config, stream, handler);
        let connected = match options.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                ProxySshError::TransportError(format!(
                    "SSH handshake with {} timed out after {}s",
                    destination,
                    limit.as_secs_f32()
                ))
            })?,
            None => connect.await,
        };
        let mut handle = connected.map_err(handshake_error)?;

        tracing::debug!("SSH handshake with {} completed", destination);

        match method {
            AuthMethod::PublicKey(key) => {
                Self::authenticate_publickey(&mut handle, user, key).await?
            }
            AuthMethod::KeyboardInteractive(responder) => {
                Self::authenticate_keyboard_interactive(&mut handle, user, responder).await?
            }
        }

        tracing::info!("Successfully authenticated to {} as {}", destination, user);

        Ok(AuthenticatedConnection {
            handle,
            destination: destination.clone(),
            user: user.to_string(),
        })
    }

    async fn authenticate_publickey(
        handle: &mut SshHandle,
        user: &str,
        key: PrivateKey,
    ) -> Result<()> {
        // RSA keys sign with the strongest SHA-2 variant the server accepts
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(auth_error)?
            .flatten();

        let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);
        let auth_res = handle
            .authenticate_publickey(user, key_with_alg)
            .await
            .map_err(auth_error)?;

        if !matches!(auth_res, AuthResult::Success) {
            return Err(ProxySshError::AuthenticationFailed(
                "Public key authentication failed".to_string(),
            ));
        }
        Ok(())
    }

    async fn authenticate_keyboard_interactive(
        handle: &mut SshHandle,
        user: &str,
        responder: Arc<dyn ChallengeResponder>,
    ) -> Result<()> {
        let mut response = handle
            .authenticate_keyboard_interactive_start(user, None::<String>)
            .await
            .map_err(auth_error)?;

        for round in 1..=MAX_KBI_ROUNDS {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(()),
                KeyboardInteractiveAuthResponse::Failure { .. } => {
                    return Err(ProxySshError::AuthenticationFailed(
                        "Keyboard-interactive authentication rejected by server".to_string(),
                    ));
                }
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    tracing::debug!(
                        "Keyboard-interactive round {} with {} prompt(s)",
                        round,
                        prompts.len()
                    );

                    let challenge = Challenge {
                        name,
                        instructions,
                        prompts: prompts
                            .into_iter()
                            .map(|p| ChallengePrompt::new(p.prompt, p.echo))
                            .collect(),
                    };
                    let expected = challenge.prompts.len();

                    let responder = Arc::clone(&responder);
                    let mut answers =
                        tokio::task::spawn_blocking(move || responder.answer(&challenge))
                            .await
                            .map_err(|e| anyhow::anyhow!("challenge responder panicked: {}", e))??;

                    if answers.len() != expected {
                        tracing::warn!(
                            "Responder returned {} answer(s) for {} prompt(s)",
                            answers.len(),
                            expected
                        );
                        answers.resize(expected, String::new());
                    }

                    response = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await
                        .map_err(auth_error)?;
                }
            }
        }

        Err(ProxySshError::AuthenticationFailed(format!(
            "Server sent more than {} keyboard-interactive rounds",
            MAX_KBI_ROUNDS
        )))
    }
}

fn handshake_error(e: russh::Error) -> ProxySshError {
    match e {
        russh::Error::UnknownKey => {
            ProxySshError::HostKeyRejected("server host key was not accepted".to_string())
        }
        other => auth_error(other),
    }
}

fn auth_error(e: russh::Error) -> ProxySshError {
    match e {
        russh::Error::IO(io) => ProxySshError::TransportError(io.to_string()),
        russh::Error::Disconnect => {
            ProxySshError::TransportError("connection closed by peer".to_string())
        }
        other => ProxySshError::AuthenticationFailed(other.to_string()),
    }
}

/// SSH client handler applying the host key policy
#[derive(Clone)]
pub struct ClientHandler {
    destination: String,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(destination: impl Into<String>, policy: HostKeyPolicy) -> Self {
        Self {
            destination: destination.into(),
            policy,
        }
    }

    /// Calculate SHA256 fingerprint of a public key
    fn calculate_fingerprint(key: &PublicKey) -> String {
        use russh::keys::ssh_key::HashAlg;
        key.fingerprint(HashAlg::Sha256).to_string()
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        let fingerprint = Self::calculate_fingerprint(server_public_key);
        let destination = self.destination.clone();
        let policy = self.policy.clone();

        async move {
            tracing::info!("Server key fingerprint for {}: {}", destination, fingerprint);

            let decision = move || policy.decide(&destination, &fingerprint);
            let accepted = tokio::task::spawn_blocking(decision)
                .await
                .map_err(|e| russh::Error::IO(std::io::Error::other(e)))?
                .map_err(russh::Error::IO)?;

            if !accepted {
                tracing::error!("Server key rejected");
            }
            Ok(accepted)
        }
    }
}
