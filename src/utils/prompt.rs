//! Interactive terminal input used by the pipeline: the username line, masked
//! secrets during authentication, and host-key confirmation.

use console::Term;
use dialoguer::{Confirm, Input, Password};
use std::io;

/// Source of interactive answers.
///
/// All methods block the calling thread; async callers go through
/// `tokio::task::spawn_blocking`.
pub trait Prompter: Send + Sync {
    /// Read one visible line of input.
    fn read_line(&self, prompt: &str) -> io::Result<String>;

    /// Read a secret without echoing it.
    fn read_secret(&self, prompt: &str) -> io::Result<String>;

    /// Ask a yes/no question, defaulting to no.
    fn confirm(&self, prompt: &str) -> io::Result<bool>;

    /// Show informational text, such as server instructions.
    fn notice(&self, _text: &str) {}
}

/// Prompter backed by the controlling terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

impl TerminalPrompter {
    pub fn new() -> Self {
        Self
    }
}

fn dialog_error(e: dialoguer::Error) -> io::Error {
    io::Error::other(e.to_string())
}

impl Prompter for TerminalPrompter {
    fn read_line(&self, prompt: &str) -> io::Result<String> {
        let line: String = Input::new()
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text()
            .map_err(dialog_error)?;
        Ok(line.trim().to_string())
    }

    fn read_secret(&self, prompt: &str) -> io::Result<String> {
        Password::new()
            .with_prompt(prompt.trim_end())
            .allow_empty_password(true)
            .interact()
            .map_err(dialog_error)
    }

    fn confirm(&self, prompt: &str) -> io::Result<bool> {
        Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(dialog_error)
    }

    fn notice(&self, text: &str) {
        let _ = Term::stderr().write_line(text);
    }
}

/// Ask for the remote username; an empty answer is a configuration error.
pub fn ask_username(prompter: &dyn Prompter) -> crate::utils::error::Result<String> {
    let user = prompter.read_line("Username")?;
    let user = user.trim();
    if user.is_empty() {
        return Err(crate::utils::error::ProxySshError::ConfigError(
            "username must not be empty".to_string(),
        ));
    }
    Ok(user.to_string())
}
