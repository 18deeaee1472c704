//! Answering keyboard-interactive challenges.
//!
//! The server sends rounds of prompts; a [`ChallengeResponder`] turns each round
//! into one answer per prompt, in order.

use crate::utils::error::Result;
use crate::utils::prompt::Prompter;
use std::sync::Arc;

/// One prompt inside a keyboard-interactive round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengePrompt {
    pub text: String,
    /// Whether the server allows the answer to be echoed
    pub echo: bool,
}

impl ChallengePrompt {
    pub fn new(text: impl Into<String>, echo: bool) -> Self {
        Self {
            text: text.into(),
            echo,
        }
    }

    /// True when the prompt asks for a password
    pub fn asks_for_password(&self) -> bool {
        self.text.to_ascii_lowercase().contains("password")
    }
}

/// One keyboard-interactive round as sent by the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Challenge {
    pub name: String,
    pub instructions: String,
    pub prompts: Vec<ChallengePrompt>,
}

/// Capability that answers keyboard-interactive rounds.
///
/// Called synchronously from a blocking thread; the returned vector must hold
/// exactly one entry per prompt.
pub trait ChallengeResponder: Send + Sync {
    fn name(&self) -> &'static str;

    fn answer(&self, challenge: &Challenge) -> Result<Vec<String>>;
}

/// Answers password prompts with masked input and leaves every other prompt empty.
pub struct PasswordOnlyResponder {
    prompter: Arc<dyn Prompter>,
}

impl PasswordOnlyResponder {
    pub fn new(prompter: Arc<dyn Prompter>) -> Self {
        Self { prompter }
    }
}

impl ChallengeResponder for PasswordOnlyResponder {
    fn name(&self) -> &'static str {
        "password-only"
    }

    fn answer(&self, challenge: &Challenge) -> Result<Vec<String>> {
        let mut answers = vec![String::new(); challenge.prompts.len()];

        for (index, prompt) in challenge.prompts.iter().enumerate() {
            if prompt.asks_for_password() {
                answers[index] = self.prompter.read_secret(&prompt.text)?;
            } else {
                tracing::debug!("Leaving prompt {:?} unanswered", prompt.text);
            }
        }

        Ok(answers)
    }
}

/// Answers every prompt: visible input when the server allows echo, masked otherwise.
pub struct PromptAllResponder {
    prompter: Arc<dyn Prompter>,
}

impl PromptAllResponder {
    pub fn new(prompter: Arc<dyn Prompter>) -> Self {
        Self { prompter }
    }
}

impl ChallengeResponder for PromptAllResponder {
    fn name(&self) -> &'static str {
        "all"
    }

    fn answer(&self, challenge: &Challenge) -> Result<Vec<String>> {
        if !challenge.name.is_empty() {
            self.prompter.notice(&challenge.name);
        }
        if !challenge.instructions.is_empty() {
            self.prompter.notice(&challenge.instructions);
        }

        challenge
            .prompts
            .iter()
            .map(|prompt| -> Result<String> {
                let answer = if prompt.echo {
                    self.prompter.read_line(&prompt.text)?
                } else {
                    self.prompter.read_secret(&prompt.text)?
                };
                Ok(answer)
            })
            .collect()
    }
}
