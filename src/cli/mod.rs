pub mod commands;

pub use commands::{AuthSelection, Cli, KbdInteractive, RunConfig};

use crate::models::AuthMethod;
use crate::services::key_service::KeyService;
use crate::services::proxy_dialer::ProxyDialer;
use crate::services::session_relay::{RelayExit, SessionRelay};
use crate::services::ssh_service::SshService;
use crate::utils::error::{ProxySshError, Result};
use crate::utils::prompt::{ask_username, Prompter};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Run a blocking prompt off the async runtime
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProxySshError::Other(anyhow::anyhow!("prompt task failed: {}", e)))?
}

/// Resolve the username and authentication method before any network activity.
pub async fn prepare_auth(
    config: &RunConfig,
    prompter: Arc<dyn Prompter>,
) -> Result<(String, AuthMethod)> {
    let user = match &config.user {
        Some(user) => user.clone(),
        None => {
            let prompter = Arc::clone(&prompter);
            blocking(move || ask_username(prompter.as_ref())).await?
        }
    };

    let method = match &config.auth {
        AuthSelection::PublicKey(path) => {
            let path = path.clone();
            let prompter = Arc::clone(&prompter);
            let key =
                blocking(move || KeyService::load_private_key(&path, prompter.as_ref())).await?;
            AuthMethod::PublicKey(key)
        }
        AuthSelection::KeyboardInteractive(mode) => {
            AuthMethod::KeyboardInteractive(mode.responder(prompter))
        }
    };

    Ok((user, method))
}

/// Dial through the proxy, authenticate and relay the shell until it ends.
///
/// `shutdown` interrupts any stage; before relaying starts that simply
/// abandons the connection attempt.
pub async fn run(
    config: RunConfig,
    prompter: Arc<dyn Prompter>,
    shutdown: CancellationToken,
) -> Result<RelayExit> {
    let setup = async {
        let (user, method) = prepare_auth(&config, prompter).await?;

        let stream = ProxyDialer::new(config.connect_timeout)
            .dial(&config.proxy, &config.destination)
            .await?;

        SshService::authenticate(stream, &user, method, &config.destination, &config.ssh).await
    };

    let connection = tokio::select! {
        connection = setup => connection?,
        _ = shutdown.cancelled() => {
            tracing::info!("Interrupted before the session started");
            return Ok(RelayExit::Interrupted);
        }
    };

    SessionRelay::new(connection, config.session)
        .run(shutdown)
        .await
}
