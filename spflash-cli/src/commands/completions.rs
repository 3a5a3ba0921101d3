//! Shell completion generation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use std::env;
use std::io;
use std::path::Path;

use crate::Cli;

/// Write the completion script for `shell`, or for `$SHELL` when omitted.
pub(crate) fn cmd_completions(shell: Option<Shell>) -> Result<()> {
    let shell = match shell {
        Some(s) => s,
        None => shell_from_env().context("$SHELL is not a known shell, pass one explicitly")?,
    };
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
    Ok(())
}

fn shell_from_env() -> Option<Shell> {
    match env::var("SHELL") {
        Ok(path) => shell_from_path(&path),
        Err(_) if cfg!(windows) && env::var_os("PSModulePath").is_some() => Some(Shell::PowerShell),
        Err(_) => None,
    }
}

fn shell_from_path(path: &str) -> Option<Shell> {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(shell_named)
}

fn shell_named(name: &str) -> Option<Shell> {
    match name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}
