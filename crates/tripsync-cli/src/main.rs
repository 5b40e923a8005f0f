mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use commands::{apply, parse_command, render_plan, Command, HELP};
use std::{
    env,
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use tripsync_client::{run_channel, SessionCommand, SyncConfig, SyncSession};
use tripsync_core::Identity;
use url::Url;

const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080/ws/poi";

#[derive(Parser, Debug)]
#[command(name = "tripsync", about = "Collaborative trip-plan sync client")]
struct Args {
    #[arg(long, default_value = "")]
    workspace: String,
    #[arg(long, default_value = "")]
    user_id: String,
    #[arg(long, default_value = "")]
    user_name: String,
    #[arg(long, default_value = "")]
    server_url: String,
    /// Comma-separated plan day ids; empty accepts any day.
    #[arg(long, default_value = "")]
    plan_days: String,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[derive(Clone, Debug)]
struct RuntimeConfig {
    workspace_id: String,
    identity: Option<Identity>,
    server_url: Url,
    plan_days: Vec<String>,
    log_dir: String,
    log_stdout: bool,
}

struct LogGuard {
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout_enabled: bool,
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args)?;
    let _log_guard = init_logging(&config);

    let mut session = SyncSession::new(
        config.workspace_id.clone(),
        config.identity.clone(),
        SyncConfig::default(),
    );
    session.set_plan_days(config.plan_days.clone());
    if config.identity.is_none() {
        warn!(event = "identity_missing", "edits are rejected until a user id is set");
    }

    let (tx, rx) = mpsc::channel::<SessionCommand>(64);
    let channel_task = tokio::spawn(run_channel(config.server_url.clone(), session, rx));
    info!(
        event = "client_started",
        workspace_id = %config.workspace_id,
        url = %config.server_url
    );
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_command(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => command,
            Err(err) => {
                eprintln!("{err}");
                continue;
            }
        };
        let job: SessionCommand = Box::new(move |session, now| match apply(session, command, now) {
            Ok(output) if output.is_empty() => {}
            Ok(output) => println!("{output}"),
            Err(err) => warn!(event = "command_failed", error = %err),
        });
        if tx.send(job).await.is_err() {
            break;
        }
    }

    drop(tx);
    let session = channel_task.await.context("channel task failed")?;
    info!(
        event = "client_stopped",
        workspace_id = %session.workspace_id(),
        pois = session.store().len()
    );
    println!("{}", render_plan(&session));
    Ok(())
}

fn load_config(args: Args) -> Result<RuntimeConfig> {
    let workspace_id = resolve_workspace(&args.workspace)?;
    let identity = resolve_identity(&args.user_id, &args.user_name);
    let server_url = resolve_server_url(&args.server_url, &workspace_id)?;
    let plan_days = resolve_plan_days(&args.plan_days);
    let log_dir = resolve_log_dir(&args.log_dir);
    let log_stdout = resolve_log_stdout();
    Ok(RuntimeConfig {
        workspace_id,
        identity,
        server_url,
        plan_days,
        log_dir,
        log_stdout,
    })
}

fn init_logging(config: &RuntimeConfig) -> Option<LogGuard> {
    let level = env::var("TRIPSYNC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let user = config
        .identity
        .as_ref()
        .map(|identity| identity.user_id.as_str())
        .unwrap_or("anonymous");
    let writer = match open_log_file(&config.log_dir, &config.workspace_id, user) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let stdout_enabled = config.log_stdout;
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), stdout_enabled));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

impl MultiWriter {
    fn new(file: Option<Arc<StdMutex<std::fs::File>>>, stdout_enabled: bool) -> Self {
        Self {
            stdout_enabled,
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stdout_enabled {
            let _ = io::stdout().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stdout_enabled {
            let _ = io::stdout().flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, workspace_id: &str, user_id: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!(
        "tripsync-{}-{}.log",
        sanitize_component(workspace_id),
        sanitize_component(user_id)
    ));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(StdMutex::new(file))),
    })
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

fn flag_or_env(flag: &str, key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_workspace(flag: &str) -> Result<String> {
    flag_or_env(flag, "TRIPSYNC_WORKSPACE")
        .context("a workspace id is required (--workspace or TRIPSYNC_WORKSPACE)")
}

fn resolve_identity(flag_id: &str, flag_name: &str) -> Option<Identity> {
    let user_id = flag_or_env(flag_id, "TRIPSYNC_USER_ID")?;
    let display_name = flag_or_env(flag_name, "TRIPSYNC_USER_NAME").unwrap_or_else(|| user_id.clone());
    Some(Identity::new(user_id, display_name))
}

fn resolve_server_url(flag: &str, workspace_id: &str) -> Result<Url> {
    let raw = flag_or_env(flag, "TRIPSYNC_SERVER_URL").unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
    let mut url = Url::parse(&raw).with_context(|| format!("invalid server url: {raw}"))?;
    if url.query_pairs().all(|(key, _)| key != "workspaceId") {
        url.query_pairs_mut().append_pair("workspaceId", workspace_id);
    }
    Ok(url)
}

fn resolve_plan_days(flag: &str) -> Vec<String> {
    flag_or_env(flag, "TRIPSYNC_PLAN_DAYS")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|day| !day.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn resolve_log_dir(flag: &str) -> String {
    flag_or_env(flag, "TRIPSYNC_LOG_DIR").unwrap_or_else(|| ".tripsync/logs".to_string())
}

fn resolve_log_stdout() -> bool {
    if let Ok(value) = env::var("TRIPSYNC_LOG_STDOUT") {
        match value.trim() {
            "1" | "true" | "TRUE" | "yes" | "YES" => return true,
            "0" | "false" | "FALSE" | "no" | "NO" => return false,
            _ => {}
        }
    }
    false
}
