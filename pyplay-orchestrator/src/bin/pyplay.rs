//! pyplay CLI - run playground samples from the terminal
//!
//! Usage:
//!   pyplay list
//!   pyplay show <ID>
//!   pyplay run [ID] [--file <PATH>]
//!   pyplay repl [FRAGMENT]
//!
//! Example:
//!   pyplay run test-fibonacci
//!   pyplay repl '#test-while' -v

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use pyplay::PlaygroundConfig;
use pyplay::output::TerminalSink;
use pyplay::playground::{Notification, Playground, PlaygroundEvent, RunStatus, Severity};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "pyplay.toml";

type TerminalPlayground = Playground<TerminalSink<std::io::Stdout>>;

#[derive(Parser)]
#[command(name = "pyplay", version, about = "Run Python playground samples")]
struct Cli {
    /// Config file (default: ./pyplay.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log verbosity, repeat for more (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the samples in the manifest
    List,
    /// Print a sample's source
    Show { id: String },
    /// Run a sample, or a file with --file
    Run {
        /// Sample id (default: the first sample)
        id: Option<String>,
        /// Run this file instead of a sample
        #[arg(short, long, conflicts_with = "id")]
        file: Option<PathBuf>,
    },
    /// Interactive session
    Repl {
        /// Initial selection, e.g. '#test-add'
        #[arg(default_value = "")]
        fragment: String,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<PlaygroundConfig> {
    match path {
        Some(path) => PlaygroundConfig::load(path)
            .with_context(|| format!("Failed to load config file: {}", path.display())),
        None if std::path::Path::new(DEFAULT_CONFIG).exists() => {
            PlaygroundConfig::load(std::path::Path::new(DEFAULT_CONFIG))
                .with_context(|| format!("Failed to load config file: {}", DEFAULT_CONFIG))
        }
        None => Ok(PlaygroundConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::List => list(&config),
        Command::Show { id } => show(&config, &id).await,
        Command::Run { id, file } => run(&config, id, file).await,
        Command::Repl { fragment } => repl(&config, &fragment).await,
    }
}

fn list(config: &PlaygroundConfig) -> Result<ExitCode> {
    let manifest = config.load_manifest().context("Failed to load manifest")?;
    for group in manifest.groups() {
        println!("{}", group.label.bold());
        for entry in group.entries {
            println!("  {:<20} {}", entry.id.cyan(), entry.display_name);
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn show(config: &PlaygroundConfig, id: &str) -> Result<ExitCode> {
    let manifest = Arc::new(config.load_manifest().context("Failed to load manifest")?);
    let cache = config.sample_cache(manifest)?;
    let sample = cache.load_sample(id).await?;
    eprintln!(
        "{} {} {}",
        "──".blue(),
        sample.display_name.bold(),
        format!("({})", sample.source_path).dimmed()
    );
    print!("{}", sample.source_text);
    Ok(ExitCode::SUCCESS)
}

fn print_notifications(playground: &mut TerminalPlayground) {
    for Notification { severity, message } in playground.take_notifications() {
        match severity {
            Severity::Info => eprintln!("{} {}", "·".dimmed(), message.dimmed()),
            Severity::Error => eprintln!("{} {}", "✗".red(), message.red()),
        }
    }
}

/// Load `fragment` into the editor; false when the load failed
async fn load_selection(playground: &mut TerminalPlayground, fragment: &str) -> bool {
    playground.select_fragment(fragment);
    let events = playground.settle().await;
    let mut loaded = false;
    for event in &events {
        match event {
            PlaygroundEvent::SampleLoaded(sample) => {
                eprintln!("{} {}", "Loaded".green(), sample.display_name.bold());
                loaded = true;
            }
            PlaygroundEvent::SampleFailed { .. } => loaded = false,
            _ => {}
        }
    }
    print_notifications(playground);
    loaded
}

/// Run the editor text and wait for it; true when it finished cleanly
async fn run_editor(playground: &mut TerminalPlayground) -> bool {
    let id = match playground.run() {
        Ok(id) => id,
        Err(_) => {
            print_notifications(playground);
            return false;
        }
    };
    let status = playground.wait_for(id).await;
    // The failure is printed below; the matching notification would repeat it
    playground.take_notifications();
    match status {
        RunStatus::Finished => {
            eprintln!("{} {}", "✓".green(), format!("run {} finished", id).dimmed());
            true
        }
        RunStatus::Failed { error } => {
            eprintln!("{} {}", "✗".red(), format!("run {} failed: {}", id, error).red());
            false
        }
        RunStatus::Pending | RunStatus::Running => false,
    }
}

async fn run(config: &PlaygroundConfig, id: Option<String>, file: Option<PathBuf>) -> Result<ExitCode> {
    let mut playground = Playground::from_config_with_sink(config, TerminalSink::stdout())?;

    match file {
        Some(path) => {
            let source = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            playground.edit_source(source);
        }
        None => {
            let fragment = id.unwrap_or_default();
            if !load_selection(&mut playground, &fragment).await {
                bail!("Could not load sample '{}'", playground.router().resolve_fragment(&fragment));
            }
        }
    }

    let ok = run_editor(&mut playground).await;
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn print_repl_help() {
    eprintln!(
        r#"{}
    #<id>      select a sample (# alone selects the default)
    :run       run the editor text
    :source    print the editor text
    :list      list samples
    :help      this message
    :quit      leave
    <code>     anything else runs as a one-line program"#,
        "COMMANDS:".bold()
    );
}

async fn repl(config: &PlaygroundConfig, fragment: &str) -> Result<ExitCode> {
    let mut playground = Playground::from_config_with_sink(config, TerminalSink::stdout())?;
    playground.start(fragment);
    playground.settle().await;
    print_notifications(&mut playground);
    print_repl_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("{} ", "pyplay>".cyan().bold());
        std::io::stderr().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        match line {
            "" => {}
            ":quit" | ":q" => break,
            ":help" => print_repl_help(),
            ":list" => {
                list(config)?;
            }
            ":source" => {
                print!("{}", playground.source().text());
                std::io::stdout().flush()?;
            }
            ":run" => {
                run_editor(&mut playground).await;
            }
            _ if line.starts_with('#') => {
                load_selection(&mut playground, line).await;
            }
            code => {
                let id = match playground.run_source(code) {
                    Ok(id) => id,
                    Err(_) => {
                        print_notifications(&mut playground);
                        continue;
                    }
                };
                if let RunStatus::Failed { error } = playground.wait_for(id).await {
                    eprintln!("{}", error.red());
                }
                playground.take_notifications();
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
