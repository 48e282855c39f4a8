//! The `loaf` multitool: a headless front end over the runtime core. The
//! interactive surfaces (TUI, JSON-RPC host) layer on the same APIs.

mod exec_cmd;

use std::io::IsTerminal;
use std::io::Read;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

pub use exec_cmd::ExecCli;

/// Loaf CLI.
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct MultitoolCli {
    #[clap(subcommand)]
    pub subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    /// Run a one-shot command through the stateful shell tool.
    #[clap(visible_alias = "e")]
    Exec(ExecCli),

    /// Apply a patch from a file or stdin.
    #[clap(visible_alias = "a")]
    Apply(ApplyCli),

    /// Show the persisted compaction state for a session rollout.
    CompactStatus(CompactStatusCli),
}

#[derive(Debug, Parser)]
pub struct ApplyCli {
    /// Patch file; `-` or absent reads stdin.
    pub patch_file: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct CompactStatusCli {
    /// The session rollout file (`rollout-<date>-<uuid>.jsonl`).
    pub rollout: PathBuf,
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

pub async fn run_main(cli: MultitoolCli) -> anyhow::Result<i32> {
    match cli.subcommand {
        Subcommand::Exec(exec_cli) => exec_cmd::run_exec(exec_cli).await,
        Subcommand::Apply(apply_cli) => run_apply(apply_cli),
        Subcommand::CompactStatus(status_cli) => run_compact_status(status_cli),
    }
}

fn run_apply(cli: ApplyCli) -> anyhow::Result<i32> {
    let patch = match cli.patch_file {
        Some(path) if path != PathBuf::from("-") => std::fs::read_to_string(&path)?,
        _ => {
            if std::io::stdin().is_terminal() {
                eprintln!("No patch provided. Pass a file or pipe the patch into stdin.");
                return Ok(1);
            }
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    match loaf_apply_patch::apply_patch(&patch, &mut stdout, &mut stderr) {
        Ok(_) => Ok(0),
        Err(_) => Ok(1),
    }
}

fn run_compact_status(cli: CompactStatusCli) -> anyhow::Result<i32> {
    let paths = loaf_compact::sidecar_paths(&cli.rollout);
    let state = loaf_compact::load_state(&paths);
    let events = loaf_compact::load_events(&paths);

    println!("events file:  {}", paths.events.display());
    println!("state file:   {}", paths.state.display());
    println!("summary file: {}", paths.summary_md.display());
    println!("events recorded: {}", events.len());
    println!("anchor: {}", state.last_anchor_event_index);
    println!();
    println!(
        "{}",
        loaf_compact::render_summary_markdown(&state.summary_state)
    );
    Ok(0)
}
