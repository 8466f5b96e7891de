use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing_subscriber::EnvFilter;

use suitetree::config::Config;
use suitetree::run::{CancelToken, RunEvent, RunState, RunSummary};
use suitetree::session::{Session, SessionOptions};
use suitetree::test_model::Outcome;
use suitetree::{is_test_project, FsEvent, NodeId, TestWatcher};

const CONFIG_FILE: &str = "suitetree.toml";

#[derive(Parser)]
#[command(name = "suitetree")]
#[command(about = "Discover, watch and selectively run a file-based test suite")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (default: suitetree.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover test files and list their cases
    List {
        /// Print the tree as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run all tests, or a selection of them
    Run {
        /// Node id to include (repeatable; runs everything if omitted)
        #[arg(short, long = "include")]
        include: Vec<String>,

        /// Node id to exclude (repeatable)
        #[arg(short, long = "exclude")]
        exclude: Vec<String>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Keep the tree in sync with the filesystem and re-run saved files
    Watch,
}

fn main() {
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(2);
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "suitetree=debug" } else { "suitetree=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Returns whether the command succeeded
fn run() -> Result<bool> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.unwrap_or_else(|| PathBuf::from(CONFIG_FILE));

    // Canonicalize config path to get absolute path, then get parent
    let config_path = std::fs::canonicalize(&config_path)
        .with_context(|| format!("Could not find config file: {}", config_path.display()))?;

    let base_dir = config_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    let config = Config::load(&config_path)
        .with_context(|| format!("Could not load {}", config_path.display()))?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Commands::List { json } => cmd_list(&config, &base_dir, json).await,
            Commands::Run { include, exclude, json } => {
                cmd_run(&config, &base_dir, &include, &exclude, json).await
            }
            Commands::Watch => cmd_watch(config, &config_path, &base_dir).await,
        }
    })
}

async fn cmd_list(config: &Config, base_dir: &Path, json: bool) -> Result<bool> {
    let session = Session::from_config(config, base_dir, SessionOptions::default())?;
    if !is_test_project(session.pattern()) {
        println!("{} No test files found under {}", "!".yellow(), session.pattern().root().display());
        return Ok(true);
    }

    session.discover()?;
    let failures = session.load_all().await;
    let listing = session.listing();

    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(failures == 0);
    }

    println!("\n{} {}\n", "Project:".bold(), config.project.name.cyan());
    for file in &listing {
        match file.file.error {
            Some(ref error) => println!("{} {}  {}", "✗".red(), file.file.label.bold(), error.red()),
            None => println!("{} {}", "▸".blue(), file.file.label.bold()),
        }
        println!("    {}", file.file.id.to_string().dimmed());
        for case in &file.children {
            let line = case.location.line.map(|l| format!(":{}", l)).unwrap_or_default();
            println!("  {} {}{}", "•".dimmed(), case.label, line.dimmed());
            println!("      {}", case.id.to_string().dimmed());
        }
    }

    let stats = session.stats();
    println!(
        "\n{} {} file(s), {} test(s){}",
        "✓".green(),
        stats.files,
        stats.cases,
        if stats.errored_files > 0 {
            format!(", {} with errors", stats.errored_files).red().to_string()
        } else {
            String::new()
        }
    );

    Ok(failures == 0)
}

async fn cmd_run(
    config: &Config,
    base_dir: &Path,
    include: &[String],
    exclude: &[String],
    json: bool,
) -> Result<bool> {
    let include = parse_ids(include)?;
    let exclude = parse_ids(exclude)?;

    let (tx, rx) = unbounded_channel();
    let options = SessionOptions {
        run_events: Some(tx),
        ..Default::default()
    };
    let session = Session::from_config(config, base_dir, options)?;
    session.discover()?;

    let (handle, token) = CancelToken::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n{} Cancelling after the current test...", "!".yellow());
            handle.cancel();
        }
    });

    let printer = (!json).then(|| tokio::spawn(print_events(rx)));
    let summary = session.run(&include, &exclude, token).await;
    drop(session);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    Ok(summary.success())
}

async fn cmd_watch(mut config: Config, config_path: &Path, base_dir: &Path) -> Result<bool> {
    loop {
        let session = Session::from_config(&config, base_dir, SessionOptions::default())?;
        let files = session.discover()?;
        println!(
            "{} Found {} test file(s) in {}",
            "✓".green(),
            files.len(),
            session.pattern().root().display()
        );

        let mut watcher = TestWatcher::start(session.pattern(), Some(config_path))?;
        println!("{}", "Press Ctrl+C to stop\n".dimmed());

        loop {
            let event = tokio::select! {
                event = watcher.next() => event,
                _ = tokio::signal::ctrl_c() => return Ok(true),
            };
            let Some(event) = event else {
                return Ok(true);
            };

            if event.path() == config_path {
                break;
            }

            if let Err(e) = session.apply(&event).await {
                println!("{} {}", "✗".red(), e);
                continue;
            }
            if let FsEvent::Created(ref path) | FsEvent::Changed(ref path) = event {
                run_saved_file(&session, path).await;
            }
        }

        println!("\n{} Config changed, rebuilding the test tree...", "↻".yellow());
        match Config::load(config_path) {
            Ok(new_config) => config = new_config,
            Err(e) => println!("{} {:#}, keeping the previous config", "✗".red(), e),
        }
    }
}

async fn run_saved_file(session: &Session, path: &Path) {
    let file_id = session.tree().lock().file_id_for_path(path);
    let Some(file_id) = file_id else {
        return;
    };

    println!("\n{} {} changed", "↻".yellow(), path.display().to_string().bold());
    if let Err(e) = session.children(&file_id).await {
        println!("{} {}", "✗".red(), e);
        return;
    }

    let summary = session.run(&[file_id], &[], CancelToken::never()).await;
    print_summary(&summary);
    println!("\n{}", "Watching for changes...".dimmed());
}

fn parse_ids(raw: &[String]) -> Result<Vec<NodeId>> {
    raw.iter()
        .map(|id| NodeId::parse(id).with_context(|| format!("Bad node id '{}'", id)))
        .collect()
}

async fn print_events(mut rx: UnboundedReceiver<RunEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::Started { nodes: Some(n), .. } => {
                println!("\n{} {} test node(s) to run\n", "→".blue(), n);
            }
            RunEvent::Started { nodes: None, .. } => {
                println!("\n{} Running the whole suite\n", "→".blue());
            }
            RunEvent::NodeFinished { result, .. } => {
                println!(
                    "{} {} {}",
                    result.outcome.colored_symbol(),
                    result.label,
                    format!("({}ms)", result.duration_ms).dimmed()
                );
                if let Some(message) = result.message {
                    for line in message.lines() {
                        println!("    {}", line.dimmed());
                    }
                }
            }
            RunEvent::SuiteFinished { report, .. } => {
                println!("{}", report.raw_output);
            }
            RunEvent::Ended { .. } => break,
            RunEvent::NodeStarted { .. } => {}
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    for id in &summary.unresolved {
        println!("{} Not found, nothing run for {}", "✗".red(), id.to_string().bold());
    }
    match summary.state {
        RunState::Cancelled => println!(
            "{} Run cancelled, {} node(s) not started",
            "!".yellow(),
            summary.not_started
        ),
        RunState::Aborted => println!(
            "{} Run aborted: {}",
            "✗".red(),
            summary.aborted.as_deref().unwrap_or("unknown reason")
        ),
        _ => {}
    }

    if let Some(ref suite) = summary.suite {
        let status = if suite.success { "passed".green() } else { "failed".red() };
        println!("{} Suite {} in {}ms", "→".blue(), status, summary.duration_ms);
        return;
    }

    let passed = summary.count(Outcome::Passed);
    let failed = summary.count(Outcome::Failed);
    let errored = summary.count(Outcome::Errored);
    let symbol = if failed + errored > 0 { "✗".red() } else { "✓".green() };
    println!(
        "{} {} passed, {} failed, {} errored in {}ms",
        symbol,
        passed.to_string().green(),
        failed.to_string().red(),
        errored.to_string().yellow(),
        summary.duration_ms
    );
}
