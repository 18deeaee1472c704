//! Interactive shell session: PTY and shell setup, then three relay loops
//! between the local standard streams and the remote channel.
//!
//! The channel itself is owned by a demultiplexer task that fans remote
//! stdout and stderr out to their loops. Every task lives in one `JoinSet`
//! and watches a session-scoped [`CancellationToken`].

use crate::models::{SessionConfig, SessionState};
use crate::services::ssh_service::AuthenticatedConnection;
use crate::utils::error::{ProxySshError, Result};
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BUFFER_SIZE: usize = 8192;
const CHUNK_QUEUE: usize = 64;

/// How long a stalled local stream may hold up shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// How long to wait for the server to take a channel close
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Extended data type code for stderr
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// How the relay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The user interrupted the session
    Interrupted,
    /// The remote side closed, with the shell's exit status when it sent one
    RemoteClosed(Option<u32>),
}

impl RelayExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted => 130,
            Self::RemoteClosed(Some(status)) => i32::try_from(*status).unwrap_or(1),
            Self::RemoteClosed(None) => 0,
        }
    }
}

/// Completion report of one supervised task
#[derive(Debug)]
pub(crate) enum LoopEnd {
    Stdin(Result<u64>),
    Stdout(Result<u64>),
    Stderr(Result<u64>),
    /// The channel closed; carries the remote exit status
    Demux(Option<u32>),
}

/// Interactive session over an authenticated connection
pub struct SessionRelay {
    connection: AuthenticatedConnection,
    config: SessionConfig,
    state: SessionState,
}

impl SessionRelay {
    pub fn new(connection: AuthenticatedConnection, config: SessionConfig) -> Self {
        Self {
            connection,
            config,
            state: SessionState::Created,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid session transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!("Session {} -> {}", self.state, next);
        self.state = next;
    }

    /// Relay the process's own stdin, stdout and stderr until the session ends.
    pub async fn run(self, shutdown: CancellationToken) -> Result<RelayExit> {
        self.run_with_io(
            shutdown,
            tokio::io::stdin(),
            tokio::io::stdout(),
            tokio::io::stderr(),
        )
        .await
    }

    pub async fn run_with_io<I, O, E>(
        mut self,
        shutdown: CancellationToken,
        stdin: I,
        stdout: O,
        mut stderr: E,
    ) -> Result<RelayExit>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let opened = tokio::select! {
            opened = self.open_shell() => Some(opened),
            _ = shutdown.cancelled() => None,
        };
        let channel = match opened {
            Some(opened) => opened?,
            None => {
                tracing::info!("Interrupted while starting the shell");
                self.abandon().await;
                return Ok(RelayExit::Interrupted);
            }
        };

        self.transition(SessionState::Relaying);
        tracing::info!(
            "Interactive session as {} on {} started",
            self.connection.user(),
            self.connection.destination()
        );

        if let Err(e) = stderr.write_all(b"Press Ctrl-C to exit\r\n").await {
            tracing::debug!("Could not print exit hint: {}", e);
        }

        let session = shutdown.child_token();
        let (stdout_tx, stdout_rx) = mpsc::channel(CHUNK_QUEUE);
        let (stderr_tx, stderr_rx) = mpsc::channel(CHUNK_QUEUE);
        let remote_stdin = channel.make_writer();

        let mut tasks = JoinSet::new();
        {
            let token = session.clone();
            tasks.spawn(async move {
                LoopEnd::Demux(demux_channel(channel, stdout_tx, stderr_tx, token).await)
            });
        }
        {
            let token = session.clone();
            tasks.spawn(async move {
                LoopEnd::Stdin(pump_input(stdin, remote_stdin, token).await)
            });
        }
        {
            let token = session.clone();
            tasks.spawn(async move {
                LoopEnd::Stdout(pump_output("stdout", stdout_rx, stdout, token).await)
            });
        }
        {
            let token = session.clone();
            tasks.spawn(async move {
                LoopEnd::Stderr(pump_output("stderr", stderr_rx, stderr, token).await)
            });
        }

        let exit = supervise(tasks, session, shutdown).await;
        self.transition(SessionState::Closed);

        match tokio::time::timeout(CLOSE_TIMEOUT, self.connection.close()).await {
            Ok(Err(e)) => tracing::warn!("Failed to disconnect cleanly: {}", e),
            Err(_) => tracing::warn!("Server did not acknowledge the disconnect"),
            Ok(Ok(())) => {}
        }

        tracing::info!("Session closed ({:?})", exit);
        Ok(exit)
    }

    /// Open the session channel, allocate a PTY and start the login shell.
    async fn open_shell(&mut self) -> Result<Channel<Msg>> {
        let mut channel = match self.connection.open_session().await {
            Ok(channel) => channel,
            Err(e) => {
                self.fail(None).await;
                return Err(e);
            }
        };

        self.transition(SessionState::PtyRequested);
        let pty = channel
            .request_pty(
                true,
                &self.config.term,
                self.config.cols,
                self.config.rows,
                0,
                0,
                &self.config.modes,
            )
            .await;
        let granted = match pty {
            Ok(()) => wait_for_reply(&mut channel).await,
            Err(e) => {
                tracing::debug!("PTY request could not be sent: {}", e);
                false
            }
        };
        if !granted {
            self.fail(Some(&channel)).await;
            return Err(ProxySshError::PtyAllocationFailed(format!(
                "server refused a {}x{} '{}' terminal",
                self.config.cols, self.config.rows, self.config.term
            )));
        }

        let started = match channel.request_shell(true).await {
            Ok(()) => wait_for_reply(&mut channel).await,
            Err(e) => {
                tracing::debug!("Shell request could not be sent: {}", e);
                false
            }
        };
        if !started {
            self.fail(Some(&channel)).await;
            return Err(ProxySshError::ShellStartFailed(
                "server refused to start a shell".to_string(),
            ));
        }

        self.transition(SessionState::ShellStarted);
        Ok(channel)
    }

    /// Close the channel and connection after a setup failure
    async fn fail(&mut self, channel: Option<&Channel<Msg>>) {
        self.transition(SessionState::Failed);
        if let Some(channel) = channel {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, channel.close()).await;
        }
        self.disconnect_quietly().await;
    }

    /// Give up on a setup that was interrupted part way
    async fn abandon(&mut self) {
        // An interrupted `fail` may already have moved to Failed
        if !self.state.is_terminal() {
            self.transition(SessionState::Failed);
        }
        self.disconnect_quietly().await;
    }

    async fn disconnect_quietly(&self) {
        match tokio::time::timeout(CLOSE_TIMEOUT, self.connection.close()).await {
            Ok(Err(e)) => tracing::debug!("Disconnect after failure: {}", e),
            Err(_) => tracing::debug!("Disconnect after failure timed out"),
            Ok(Ok(())) => {}
        }
    }
}

/// Wait for the server's answer to a want-reply channel request
async fn wait_for_reply(channel: &mut Channel<Msg>) -> bool {
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Success => return true,
            ChannelMsg::Failure => return false,
            ChannelMsg::Close => return false,
            other => tracing::trace!("Ignoring {:?} while awaiting reply", other),
        }
    }
    false
}

/// Own the channel and fan its output out to the stdout and stderr loops.
async fn demux_channel(
    mut channel: Channel<Msg>,
    stdout: mpsc::Sender<Vec<u8>>,
    stderr: mpsc::Sender<Vec<u8>>,
    token: CancellationToken,
) -> Option<u32> {
    let mut exit_status = None;

    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!("Closing channel");
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, channel.close()).await;
                break;
            }
            msg = channel.wait() => msg,
        };

        match msg {
            Some(ChannelMsg::Data { data }) => {
                forward(&stdout, data.to_vec(), &token).await;
            }
            Some(ChannelMsg::ExtendedData { data, ext }) if ext == SSH_EXTENDED_DATA_STDERR => {
                forward(&stderr, data.to_vec(), &token).await;
            }
            Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                tracing::debug!("Remote shell exited with status {}", status);
                exit_status = Some(status);
            }
            Some(ChannelMsg::Eof) => {
                tracing::debug!("Remote end sent EOF");
            }
            Some(ChannelMsg::Close) | None => {
                tracing::debug!("Remote end closed the channel");
                break;
            }
            Some(other) => {
                tracing::trace!("Unhandled channel message: {:?}", other);
            }
        }
    }

    exit_status
}

/// Queue a chunk for a local stream unless the session is closing.
///
/// A dropped receiver means the local stream failed; the chunk is discarded
/// and the channel keeps being drained.
async fn forward(queue: &mpsc::Sender<Vec<u8>>, chunk: Vec<u8>, token: &CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = queue.send(chunk) => {}
    }
}

fn relay_io(stream: &'static str, e: std::io::Error) -> ProxySshError {
    ProxySshError::RelayIo {
        stream,
        reason: e.to_string(),
    }
}

/// Copy local input to the remote side until EOF, error or cancellation.
pub(crate) async fn pump_input<R, W>(
    mut reader: R,
    mut writer: W,
    token: CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read(&mut buf) => read.map_err(|e| relay_io("stdin", e))?,
        };

        if n == 0 {
            tracing::debug!("Local stdin reached EOF");
            let _ = writer.shutdown().await;
            break;
        }

        let write = async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        };
        tokio::select! {
            written = write => written.map_err(|e| relay_io("stdin", e))?,
            // The remote window may stay shut
            _ = token.cancelled() => break,
        }
        total += n as u64;
    }

    Ok(total)
}

/// Write remote output chunks to a local stream.
///
/// Queued chunks are written before cancellation is honoured, so output the
/// server sent before closing is not lost. Once cancelled, a write that
/// makes no progress for [`DRAIN_TIMEOUT`] ends the loop and the rest of
/// the output is dropped.
pub(crate) async fn pump_output<W>(
    stream: &'static str,
    mut chunks: mpsc::Receiver<Vec<u8>>,
    mut writer: W,
    token: CancellationToken,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;

    loop {
        let chunk = tokio::select! {
            biased;
            chunk = chunks.recv() => chunk,
            _ = token.cancelled() => None,
        };
        let Some(chunk) = chunk else { break };

        let write = async {
            writer.write_all(&chunk).await?;
            writer.flush().await
        };
        tokio::pin!(write);

        let written = tokio::select! {
            biased;
            written = &mut write => Some(written),
            _ = token.cancelled() => tokio::time::timeout(DRAIN_TIMEOUT, &mut write).await.ok(),
        };
        match written {
            Some(written) => written.map_err(|e| relay_io(stream, e))?,
            None => {
                tracing::warn!("Local {} is stalled, dropping remaining output", stream);
                break;
            }
        }
        total += chunk.len() as u64;
    }

    Ok(total)
}

/// Watch every relay task until all have finished.
///
/// The session is closed when the remote output ends or `shutdown` fires.
/// A loop failing on its own is logged and the rest keep running.
pub(crate) async fn supervise(
    mut tasks: JoinSet<LoopEnd>,
    session: CancellationToken,
    shutdown: CancellationToken,
) -> RelayExit {
    let mut interrupted = false;
    let mut exit_status = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled(), if !interrupted => {
                tracing::info!("Interrupted, closing session");
                interrupted = true;
                session.cancel();
            }
            joined = tasks.join_next() => {
                let Some(joined) = joined else { break };
                match joined {
                    Ok(LoopEnd::Demux(status)) => {
                        exit_status = exit_status.or(status);
                        session.cancel();
                    }
                    Ok(LoopEnd::Stdout(Ok(bytes))) => {
                        tracing::debug!("Remote stdout ended after {} bytes", bytes);
                        session.cancel();
                    }
                    Ok(LoopEnd::Stdin(Ok(bytes))) => {
                        tracing::debug!("Local stdin relay finished after {} bytes", bytes);
                    }
                    Ok(LoopEnd::Stderr(Ok(bytes))) => {
                        tracing::debug!("Remote stderr ended after {} bytes", bytes);
                    }
                    Ok(LoopEnd::Stdin(Err(e)))
                    | Ok(LoopEnd::Stdout(Err(e)))
                    | Ok(LoopEnd::Stderr(Err(e))) => {
                        tracing::warn!("{}", e);
                    }
                    Err(e) => {
                        tracing::error!("Relay task failed: {}", e);
                    }
                }
            }
        }
    }

    // The session token is a child of `shutdown`, so loops may finish
    // before the branch above is polled
    if interrupted || shutdown.is_cancelled() {
        RelayExit::Interrupted
    } else {
        RelayExit::RemoteClosed(exit_status)
    }
}
