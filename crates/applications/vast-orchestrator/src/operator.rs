//! Operator interaction: progress output and confirmations
//!
//! Library code never reads stdin directly. Destructive steps (restarting a
//! running instance, overwriting the account SSH key) ask a [`Confirmation`],
//! so headless callers can plug in [`AutoConfirm`].

use crate::error::Result;
use std::io::Write;

/// Line-oriented progress output
pub trait ProgressSink: Send + Sync {
    /// Write one line for the operator
    fn line(&self, message: &str);
}

/// Writes progress lines to stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl ProgressSink for StdoutSink {
    fn line(&self, message: &str) {
        println!("{}", message);
    }
}

/// Gate for destructive operations
pub trait Confirmation: Send + Sync {
    /// Ask the operator; `Ok(true)` only on an explicit yes
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Prompts on stdin with `[y/N]`
#[derive(Debug, Default, Clone, Copy)]
pub struct InteractiveConfirmation;

impl Confirmation for InteractiveConfirmation {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        print!("{} [y/N]: ", prompt);
        std::io::stdout().flush()?;
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        Ok(is_yes(&input))
    }
}

/// Fixed answer for non-interactive callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoConfirm(bool);

impl AutoConfirm {
    /// Approve every confirmation
    pub fn yes() -> Self {
        Self(true)
    }

    /// Decline every confirmation
    pub fn no() -> Self {
        Self(false)
    }
}

impl Confirmation for AutoConfirm {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        tracing::info!(answer = self.0, "Auto-answering: {}", prompt);
        Ok(self.0)
    }
}

fn is_yes(input: &str) -> bool {
    matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
}
