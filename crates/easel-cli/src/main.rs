use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use easel_contracts::credentials::{credential_fingerprint, CredentialStore};
use easel_contracts::events::EventLog;
use easel_contracts::items::{ItemStatus, QueueState};
use easel_contracts::session::{session_summary, SessionStore};
use easel_engine::export::{archive_directory, write_archive};
use easel_engine::{default_adapter_registry, QueueWorker, StartBlocked};

#[derive(Debug, Parser)]
#[command(name = "easel", version, about = "Batch image generation from prompt lists")]
struct Cli {
    /// Directory holding session and credential files.
    #[arg(long, default_value = ".easel", global = true)]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate one image per prompt line, with interactive queue control.
    Run(RunArgs),
    /// Record the active account (email-shape check only).
    Login { email: String },
    /// Forget the active account.
    Logout,
    /// Show the active account and theme.
    Whoami,
    /// Manage per-provider API credentials.
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// List the registered provider adapters.
    Providers,
    /// Toggle the persisted dark/light theme.
    Theme,
    /// Archive the images saved by a previous run.
    Export(ExportArgs),
}

#[derive(Debug, Subcommand)]
enum KeyAction {
    Set { provider: String, credential: String },
    Clear { provider: String },
    List,
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// Prompt list, one prompt per line; `-` reads stdin.
    #[arg(long)]
    prompts: PathBuf,
    #[arg(long, default_value = "dryrun")]
    provider: String,
    /// Run directory for saved images and events.jsonl.
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value = "1024x1024")]
    size: String,
    /// Optional archive written after the run completes.
    #[arg(long)]
    archive: Option<PathBuf>,
    /// Skip the control prompt and just drain the queue.
    #[arg(long)]
    no_input: bool,
}

#[derive(Debug, Parser)]
struct ExportArgs {
    /// A previous run directory containing saved images.
    #[arg(long)]
    run: PathBuf,
    #[arg(long)]
    out: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("easel error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_batch(&cli.state_dir, args),
        Command::Login { email } => {
            let mut session = SessionStore::load(cli.state_dir.join("session.json"));
            if session.login(&email)? {
                println!("Logged in as {email}");
                Ok(0)
            } else {
                eprintln!("'{email}' does not look like an email address");
                Ok(1)
            }
        }
        Command::Logout => {
            let mut session = SessionStore::load(cli.state_dir.join("session.json"));
            session.logout()?;
            println!("Logged out");
            Ok(0)
        }
        Command::Whoami => {
            let session = SessionStore::load(cli.state_dir.join("session.json"));
            println!("{}", session_summary(&session));
            Ok(0)
        }
        Command::Key { action } => run_key(&cli.state_dir, action),
        Command::Providers => {
            for name in default_adapter_registry().names() {
                println!("{name}");
            }
            Ok(0)
        }
        Command::Theme => {
            let mut session = SessionStore::load(cli.state_dir.join("session.json"));
            println!("Theme: {}", session.toggle_theme()?);
            Ok(0)
        }
        Command::Export(args) => {
            let count = archive_directory(&args.run, &args.out)?;
            println!("Archived {count} images to {}", args.out.display());
            Ok(0)
        }
    }
}

fn run_key(state_dir: &Path, action: KeyAction) -> Result<i32> {
    let mut credentials = CredentialStore::new(state_dir.join("credentials.json"));
    match action {
        KeyAction::Set {
            provider,
            credential,
        } => {
            credentials.set(&provider, credential)?;
            println!("Credential stored for {provider}");
        }
        KeyAction::Clear { provider } => {
            credentials.remove(&provider)?;
            println!("Credential cleared for {provider}");
        }
        KeyAction::List => {
            for provider in credentials.providers() {
                let fingerprint = credentials
                    .get(&provider)
                    .map(|value| credential_fingerprint(&value))
                    .unwrap_or_else(|| "empty".to_string());
                println!("{provider}  {fingerprint}");
            }
        }
    }
    Ok(0)
}

fn run_batch(state_dir: &Path, args: RunArgs) -> Result<i32> {
    let text = read_prompts(&args.prompts)?;
    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;

    let session = SessionStore::load(state_dir.join("session.json"));
    let credentials = CredentialStore::new(state_dir.join("credentials.json"));
    let events = EventLog::new(
        args.out.join("events.jsonl"),
        format!("batch-{}", Uuid::new_v4()),
    );
    let worker = QueueWorker::new(
        default_adapter_registry(),
        credentials,
        session,
        events,
        &args.provider,
        &args.size,
    );

    if !worker.set_prompts(&text)? {
        eprintln!("queue is running; prompt edits ignored");
        return Ok(1);
    }
    let queued = worker.snapshot()?.items.len();
    if let Err(blocked) = worker.start()? {
        eprintln!("cannot start: {blocked}");
        match blocked {
            StartBlocked::NotLoggedIn => eprintln!("log in first with `easel login you@example.com`"),
            StartBlocked::MissingCredential(provider) => {
                eprintln!("store a key with `easel key set {provider} <credential>`")
            }
            StartBlocked::UnknownProvider(_) => {
                eprintln!("see `easel providers` for the supported ids")
            }
            StartBlocked::NoPrompts => {}
        }
        return Ok(1);
    }
    println!("Queued {queued} prompts for '{}'", args.provider);
    println!("Logging events to {}", worker.events().path().display());

    let runner = worker.clone();
    let interactive = !args.no_input;
    let handle = thread::spawn(move || -> Result<()> {
        runner.run_loop()?;
        // The control loop may be blocked reading stdin when the queue
        // drains; tell the user instead of sitting silent.
        if interactive {
            if let Some(notice) = drain_notice(&runner.snapshot()?) {
                println!("\n{notice}");
            }
        }
        Ok(())
    });

    if !args.no_input {
        control_loop(&worker)?;
        // No-op when the queue already drained; otherwise unblocks the join.
        worker.stop()?;
    }
    handle
        .join()
        .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;

    let state = worker.snapshot()?;
    save_images(&state, &args.out)?;
    print_summary(&state);
    if let Some(archive) = args.archive.as_deref() {
        if state.completed_count() > 0 {
            let count = write_archive(&state.items, archive)?;
            println!("Archived {count} images to {}", archive.display());
        }
    }
    Ok(if state.failed_count() > 0 { 1 } else { 0 })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ControlCommand {
    Status,
    Pause,
    Resume,
    Stop,
    Clear,
    Quit,
    Retry(usize),
    Provider(String),
    Export(String),
}

/// Parses one REPL line. `Ok(None)` is a blank line; `Err` carries the
/// message to show the user.
fn parse_control(input: &str) -> Result<Option<ControlCommand>, String> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }
    let Some(command) = input.strip_prefix('/') else {
        return Err("unknown input; commands start with /".to_string());
    };
    let parts = shell_words::split(command).unwrap_or_else(|_| {
        command
            .split_whitespace()
            .map(str::to_string)
            .collect::<Vec<String>>()
    });
    let Some((name, rest)) = parts.split_first() else {
        return Ok(None);
    };

    let parsed = match name.as_str() {
        "status" => ControlCommand::Status,
        "pause" => ControlCommand::Pause,
        "resume" => ControlCommand::Resume,
        "stop" => ControlCommand::Stop,
        "clear" => ControlCommand::Clear,
        "quit" | "exit" => ControlCommand::Quit,
        "retry" => {
            let Some(index) = rest.first().and_then(|value| value.parse::<usize>().ok()) else {
                return Err("/retry requires an item index".to_string());
            };
            ControlCommand::Retry(index)
        }
        "provider" => {
            let Some(name) = rest.first() else {
                return Err("/provider requires an adapter id".to_string());
            };
            ControlCommand::Provider(name.clone())
        }
        "export" => {
            let Some(path) = rest.first() else {
                return Err("/export requires a path".to_string());
            };
            ControlCommand::Export(path.clone())
        }
        other => return Err(format!("unknown command /{other}")),
    };
    Ok(Some(parsed))
}

/// The message printed when the queue finishes while the REPL is blocked on
/// stdin. None while anything is still pending or running.
fn drain_notice(state: &QueueState) -> Option<String> {
    if state.items.is_empty() || state.running || state.pending_count() > 0 {
        return None;
    }
    Some(format!(
        "queue drained: {} ok, {} failed; press Enter for the summary",
        state.completed_count(),
        state.failed_count(),
    ))
}

fn control_loop(worker: &QueueWorker) -> Result<()> {
    println!(
        "Control: /status /pause /resume /stop /clear /retry N /provider NAME /export PATH /quit"
    );
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        {
            let state = worker.snapshot()?;
            if !state.running && state.pending_count() == 0 && !state.items.is_empty() {
                return Ok(());
            }
        }
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            // stdin closed; wait for the queue to drain on its own
            loop {
                let state = worker.snapshot()?;
                if !state.running {
                    return Ok(());
                }
                thread::sleep(std::time::Duration::from_millis(100));
            }
        }

        let command = match parse_control(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };

        match command {
            ControlCommand::Status => print_summary(&worker.snapshot()?),
            ControlCommand::Pause => worker.pause()?,
            ControlCommand::Resume => worker.resume()?,
            ControlCommand::Stop => worker.stop()?,
            ControlCommand::Clear => worker.clear()?,
            ControlCommand::Quit => return Ok(()),
            ControlCommand::Retry(index) => match worker.retry(index) {
                Ok(()) => println!("retried item {index}"),
                Err(err) => println!("retry failed: {err:#}"),
            },
            ControlCommand::Provider(name) => {
                if worker.set_provider(&name)? {
                    println!("provider set to {name}");
                } else {
                    println!("cannot change provider while running");
                }
            }
            ControlCommand::Export(path) => {
                let state = worker.snapshot()?;
                match write_archive(&state.items, Path::new(&path)) {
                    Ok(count) => println!("archived {count} images to {path}"),
                    Err(err) => println!("export failed: {err:#}"),
                }
            }
        }
    }
}

fn read_prompts(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("failed reading prompts from stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))
}

fn save_images(state: &QueueState, out: &Path) -> Result<()> {
    for item in &state.items {
        if item.status != ItemStatus::Ok {
            continue;
        }
        let Some(bytes) = item.image_data.as_deref() else {
            continue;
        };
        let path = out.join(&item.name);
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

fn print_summary(state: &QueueState) {
    println!(
        "{} items  cursor {}  ok {}  failed {}  pending {}{}{}",
        state.items.len(),
        state.cursor,
        state.completed_count(),
        state.failed_count(),
        state.pending_count(),
        if state.running { "  running" } else { "" },
        if state.paused { "  paused" } else { "" },
    );
    for (index, item) in state.items.iter().enumerate() {
        let status = match item.status {
            ItemStatus::Pending => "pending".to_string(),
            ItemStatus::Ok => "ok".to_string(),
            ItemStatus::Fail => format!(
                "fail: {}",
                item.error.as_deref().unwrap_or("unknown error")
            ),
        };
        println!("  [{index}] {}  {}", item.name, status);
    }
}
