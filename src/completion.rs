//! # Shell Completion Module
//!
//! Completion scripts for the `emotune` binary, generated from the clap
//! definitions in [`crate::cli`].
//!
//! ```bash
//! emotune completion bash > ~/.local/share/bash-completion/completions/emotune
//! emotune completion zsh > ~/.config/zsh/completions/_emotune
//! ```

use crate::cli::{Args, Shell};
use clap::{Command, CommandFactory};
use clap_complete::{generate, Generator, Shell as CompletionShell};
use std::io::Write;

/// Writes the completion script for `gen` to `out`.
pub fn generate_completions<G: Generator>(gen: G, cmd: &mut Command, out: &mut dyn Write) {
    let name = cmd.get_name().to_string();
    generate(gen, cmd, name, out);
}

/// Writes the completion script of the `emotune` CLI for `shell`.
pub fn write_completions(shell: Shell, out: &mut dyn Write) {
    let mut cmd = Args::command();
    generate_completions(shell_to_completion_shell(shell), &mut cmd, out);
}

/// Convert our Shell enum to clap_complete's Shell enum
pub fn shell_to_completion_shell(shell: Shell) -> CompletionShell {
    match shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_conversion() {
        assert_eq!(shell_to_completion_shell(Shell::Bash), CompletionShell::Bash);
        assert_eq!(shell_to_completion_shell(Shell::Zsh), CompletionShell::Zsh);
    }

    #[test]
    fn test_bash_script_mentions_commands() {
        let mut out = Vec::new();
        write_completions(Shell::Bash, &mut out);
        let script = String::from_utf8(out).expect("utf-8 script");
        assert!(script.contains("emotune"));
        assert!(script.contains("now-playing"));
    }
}
