mod access;
mod backup;
mod config;
mod db;
mod ipc;
mod questions;
mod scoring;

use serde_json::json;
use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

fn init_logging(cfg: &config::Config) {
    // stdout carries the protocol, so logs go to stderr.
    // LMSD_LOG was validated by Config::from_env.
    let filter = cfg
        .log_filter
        .as_deref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(config::default_log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

fn write_line(stdout: &mut io::Stdout, resp: &serde_json::Value) -> io::Result<()> {
    let line = serde_json::to_string(resp).map_err(io::Error::other)?;
    writeln!(stdout, "{}", line)?;
    stdout.flush()
}

fn main() {
    let cfg = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("lmsd: {e}");
            std::process::exit(2);
        }
    };
    init_logging(&cfg);
    tracing::info!(version = config::APP_VERSION, "lmsd starting");

    let mut state = ipc::AppState::new(cfg.clone());
    if let Some(path) = cfg.workspace.as_deref() {
        if let Err(e) = ipc::open_workspace(&mut state, path) {
            tracing::error!(
                workspace = %path.display(),
                error = %e,
                "failed to open configured workspace"
            );
            std::process::exit(2);
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request line");
                // No id to echo back.
                json!({
                    "id": serde_json::Value::Null,
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                })
            }
        };

        if let Err(e) = write_line(&mut stdout, &resp) {
            tracing::error!(error = %e, "stdout write failed");
            break;
        }
    }

    tracing::info!("lmsd stopping");
}
