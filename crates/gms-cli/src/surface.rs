use std::io::{self, Write};

use gms_core::{PromptReason, PromptSurface};
use tracing::warn;

/// Prints the re-login prompt on the controlling terminal.
#[derive(Debug, Default)]
pub struct TerminalSurface;

impl TerminalSurface {
    fn message(reason: PromptReason) -> &'static str {
        match reason {
            PromptReason::IdleTimeout => "You have been inactive for too long.",
            PromptReason::TokenExpired => "Your session has expired.",
        }
    }
}

impl PromptSurface for TerminalSurface {
    fn show_relogin_prompt(&self, reason: PromptReason) -> bool {
        let mut stdout = io::stdout().lock();
        let written = writeln!(
            stdout,
            "\n{} Please sign in again.\nPress Enter to sign out.",
            Self::message(reason)
        )
        .and_then(|_| stdout.flush());

        match written {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Could not write prompt to terminal");
                false
            }
        }
    }
}
