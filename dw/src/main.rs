//! DripWriter - paced text release into documents
//!
//! CLI entry point: control commands, one-shot ticks and the foreground daemon.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use dripwriter::cli::{Cli, Command, OutputFormat, format_row, format_status, get_log_path};
use dripwriter::{
    ChannelScheduler, Clock, Config, Daemon, DripController, FileAppender, NullScheduler, Scheduler, SessionStatus,
    SessionStore, SqliteStore, StaticTokenProvider, SystemClock, Worker,
};

fn setup_logging(verbose: bool) -> Result<()> {
    // Note: Can't log here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

/// Wire the SQLite store, local collaborators and the worker together
fn build(config: &Config, scheduler: Arc<dyn Scheduler>) -> Result<(DripController, Arc<Worker>)> {
    debug!(db_path = %config.storage.db_path, "build: called");
    let store: Arc<dyn SessionStore> =
        Arc::new(SqliteStore::open(&config.storage.db_path).context("Failed to open session store")?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let appender = Arc::new(FileAppender::new(&config.documents.dir));
    let tokens = Arc::new(StaticTokenProvider::new(config.auth.revoked_owners.iter().cloned()));

    let worker = Arc::new(
        Worker::new(
            store.clone(),
            appender,
            tokens,
            clock.clone(),
            config.pacing.clone(),
            config.worker.clone(),
        )
        .with_scheduler(scheduler.clone()),
    );
    let control = DripController::new(store, worker.clone(), scheduler, clock, config.pacing.clone());
    Ok((control, worker))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run => cmd_run(&config).await,
        Command::Logs { follow, lines } => cmd_logs(follow, lines),
        command => {
            let (control, _worker) = build(&config, Arc::new(NullScheduler))?;
            dispatch(&control, &config, command).await
        }
    }
}

async fn dispatch(control: &DripController, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Start {
            owner,
            doc,
            duration,
            text,
            file,
            no_kick,
        } => {
            debug!(%owner, %doc, duration, no_kick, "dispatch: matched Start");
            let text = read_text(text, file)?;
            let id = control.start(&owner, &doc, &text, duration).await?;
            println!("Started {}", id);
            if !no_kick {
                let outcome = control.tick(Some(&id)).await?;
                println!("{}", outcome);
            }
        }
        Command::Pause { id } => {
            let id = resolve_id(control, &id).await?;
            print!("{}", format_status(&control.pause(&id).await?));
        }
        Command::Resume { id } => {
            let id = resolve_id(control, &id).await?;
            print!("{}", format_status(&control.resume(&id).await?));
        }
        Command::Cancel { id } => {
            let id = resolve_id(control, &id).await?;
            print!("{}", format_status(&control.cancel(&id).await?));
        }
        Command::Status { id, format } => {
            let id = resolve_id(control, &id).await?;
            let view = control.status(&id).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
                OutputFormat::Text => print!("{}", format_status(&view)),
            }
        }
        Command::List { status, format } => {
            let status = status
                .map(|s| s.parse::<SessionStatus>())
                .transpose()
                .map_err(|e| eyre::eyre!(e))?;
            let views = control.list(status).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&views)?),
                OutputFormat::Text if views.is_empty() => println!("No sessions"),
                OutputFormat::Text => {
                    for view in &views {
                        println!("{}", format_row(view));
                    }
                }
            }
        }
        Command::Inspect { id } => {
            let id = resolve_id(control, &id).await?;
            let session = control.inspect(&id).await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        Command::Tick { id } => {
            let id = match id {
                Some(id) => Some(resolve_id(control, &id).await?),
                None => None,
            };
            println!("{}", control.tick(id.as_deref()).await?);
        }
        Command::Sweep { batch } => {
            let outcomes = control.sweep(batch.unwrap_or(config.sweep.batch_size)).await?;
            if outcomes.is_empty() {
                println!("Nothing due");
            }
            for outcome in &outcomes {
                println!("{}", outcome);
            }
        }
        Command::Repair { id } => {
            let id = resolve_id(control, &id).await?;
            let report = control.repair(&id).await?;
            if report.changed() {
                println!(
                    "Repaired {}: cursor {} -> {}, words {} -> {}",
                    id,
                    report.previous_cursor,
                    report.session.cursor,
                    report.previous_applied,
                    report.session.applied_word_count
                );
            } else {
                println!("Accounting for {} is consistent", id);
            }
            print!("{}", format_status(&report.session.status_view()));
        }
        other => return Err(eyre::eyre!("Not a session command: {:?}", other)),
    }
    Ok(())
}

/// Text from --text, --file, or stdin
fn read_text(text: Option<String>, file: Option<PathBuf>) -> Result<String> {
    if let Some(text) = text {
        return Ok(text);
    }
    if let Some(path) = file {
        return fs::read_to_string(&path).context(format!("Failed to read {}", path.display()));
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("Failed to read text from stdin")?;
    Ok(buf)
}

/// Accept a full id or any fragment that matches exactly one session
async fn resolve_id(control: &DripController, fragment: &str) -> Result<String> {
    if control.inspect(fragment).await.is_ok() {
        return Ok(fragment.to_string());
    }

    let matches: Vec<String> = control
        .list(None)
        .await?
        .into_iter()
        .map(|view| view.id)
        .filter(|id| id.contains(fragment))
        .collect();

    match matches.as_slice() {
        [id] => Ok(id.clone()),
        [] => Err(eyre::eyre!("No session matches '{}'", fragment)),
        _ => Err(eyre::eyre!(
            "'{}' matches {} sessions, be more specific",
            fragment,
            matches.len()
        )),
    }
}

/// Foreground daemon: sweep + kicks until SIGINT/SIGTERM
async fn cmd_run(config: &Config) -> Result<()> {
    debug!("cmd_run: called");
    let (scheduler, kicks) = ChannelScheduler::new(256);
    let (_control, worker) = build(config, Arc::new(scheduler))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let daemon = Daemon::new(worker, kicks, config.sweep.clone());
    let daemon_handle = tokio::spawn(daemon.run(shutdown_rx));

    println!(
        "DripWriter daemon running (sweep every {}s). Press Ctrl+C to stop.",
        config.sweep.interval_secs
    );

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                debug!("cmd_run: SIGINT received, initiating shutdown");
                warn!("SIGINT received");
            }
            _ = sigterm.recv() => {
                debug!("cmd_run: SIGTERM received, initiating shutdown");
                warn!("SIGTERM received");
            }
        }
    }

    #[cfg(not(unix))]
    {
        debug!("cmd_run: waiting for ctrl_c (non-Unix)");
        tokio::signal::ctrl_c().await?;
    }

    info!("Daemon shutting down...");
    let _ = shutdown_tx.send(()).await;
    daemon_handle.await.context("Daemon task failed")??;

    debug!("cmd_run: shutdown complete");
    Ok(())
}

fn cmd_logs(follow: bool, lines: usize) -> Result<()> {
    debug!(follow, lines, "cmd_logs: called");
    let log_path = get_log_path();

    if !log_path.exists() {
        println!("No log file found at: {}", log_path.display());
        return Ok(());
    }

    if follow {
        println!("Following log file: {} (Ctrl+C to stop)", log_path.display());
        println!();

        let mut child = std::process::Command::new("tail")
            .args(["-f", "-n", &lines.to_string()])
            .arg(&log_path)
            .spawn()
            .context("Failed to run tail -f")?;

        child.wait()?;
    } else {
        let file = fs::File::open(&log_path).context("Failed to open log file")?;
        let reader = BufReader::new(file);
        let all_lines: Vec<String> = reader.lines().map_while(Result::ok).collect();

        let start = all_lines.len().saturating_sub(lines);
        for line in &all_lines[start..] {
            println!("{}", line);
        }
    }

    Ok(())
}
