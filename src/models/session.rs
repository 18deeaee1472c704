use russh::Pty;
use std::fmt;

/// Terminal type requested for the remote PTY
pub const DEFAULT_TERM: &str = "dumb";
pub const DEFAULT_COLS: u32 = 80;
pub const DEFAULT_ROWS: u32 = 40;
/// Baud rate advertised for both directions
pub const DEFAULT_BAUD: u32 = 14400;

/// Remote pseudo-terminal parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    /// Terminal mode opcodes and their values
    pub modes: Vec<(Pty, u32)>,
}

impl SessionConfig {
    pub fn new(term: impl Into<String>, cols: u32, rows: u32) -> Self {
        Self {
            term: term.into(),
            cols,
            rows,
            modes: default_modes(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_TERM, DEFAULT_COLS, DEFAULT_ROWS)
    }
}

/// Echo off, CR ignored on input, 14.4 kbaud each way
pub fn default_modes() -> Vec<(Pty, u32)> {
    vec![
        (Pty::ECHO, 0),
        (Pty::IGNCR, 1),
        (Pty::TTY_OP_ISPEED, DEFAULT_BAUD),
        (Pty::TTY_OP_OSPEED, DEFAULT_BAUD),
    ]
}

/// Lifecycle of the interactive session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    PtyRequested,
    ShellStarted,
    Relaying,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether `next` directly follows `self`
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Created, PtyRequested)
            | (PtyRequested, ShellStarted)
            | (ShellStarted, Relaying)
            | (Relaying, Closed) => true,
            (state, Failed) => !state.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::PtyRequested => "pty-requested",
            Self::ShellStarted => "shell-started",
            Self::Relaying => "relaying",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
