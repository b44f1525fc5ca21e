//! Log command implementation.

use super::resolve_data_dir;
use crate::cluster::MemberSettings;
use crate::consensus::Command;
use crate::storage::{CommandLog, PrunableLog};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Command log operations.
#[derive(Args, Debug)]
pub struct LogArgs {
    #[command(subcommand)]
    pub command: LogCommand,
}

/// Log subcommands.
#[derive(Subcommand, Debug)]
pub enum LogCommand {
    /// Show segment layout and, optionally, the newest entries.
    Inspect {
        /// Data directory (defaults to the config's).
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
        /// Number of newest entries to print.
        #[arg(long, default_value_t = 0)]
        tail: u64,
    },
}

/// Run the log command.
pub fn run_log(args: LogArgs, config_path: &Path) -> Result<()> {
    match args.command {
        LogCommand::Inspect { data_dir, tail } => inspect_log(data_dir, config_path, tail),
    }
}

fn inspect_log(data_dir: Option<PathBuf>, config_path: &Path, tail: u64) -> Result<()> {
    let data_dir = resolve_data_dir(data_dir, config_path)?;
    let settings = MemberSettings::new(0, data_dir, Vec::new());
    let log = CommandLog::open(settings.log_dir(), settings.log_rotation_size)
        .with_context(|| format!("failed to open {:?}", settings.log_dir()))?;
    let layout = log.layout();

    println!("Log: {:?}", log.dir());
    println!("  first_index: {}", layout.first_index);
    println!("  last:        {}", log.last_position());
    println!("  entries:     {}", layout.entry_count());
    println!("  bytes:       {}", layout.total_bytes());
    println!("  segments:    {}", layout.segments.len());
    for segment in &layout.segments {
        println!(
            "    {:016}  [{}..={}]  {:>10} bytes  {:?}",
            segment.id, segment.first_index, segment.last_index, segment.size_bytes, segment.state
        );
    }

    if tail > 0 && !log.is_empty() {
        let start = layout
            .last_index
            .saturating_sub(tail - 1)
            .max(layout.first_index);
        let entries = log
            .read_entries(start, layout.last_index + 1)
            .context("failed to read log entries")?;
        println!("  newest entries:");
        for entry in entries {
            println!("    {:>12}  {}", entry.position.to_string(), describe(&entry.command));
        }
    }
    Ok(())
}

fn describe(command: &Command) -> String {
    match command {
        Command::SeedIdentity {
            pair,
            initial_members,
        } => format!("seed_identity {pair} members={initial_members:?}"),
        Command::AddMember { member_id } => format!("add_member {member_id}"),
        Command::RemoveMember { member_id } => format!("remove_member {member_id}"),
        Command::Data { key, value } => format!(
            "data key={} value_len={}",
            String::from_utf8_lossy(key),
            value.len()
        ),
        Command::Noop => "noop".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_commands() {
        assert_eq!(describe(&Command::AddMember { member_id: 4 }), "add_member 4");
        assert_eq!(
            describe(&Command::data("user/1", vec![0u8; 3])),
            "data key=user/1 value_len=3"
        );
    }
}
