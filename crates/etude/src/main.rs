// src/main.rs
use clap::Parser;
use etude::{Config, Server, init_logging_with_level};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "etude")]
#[command(about = "Static file server on edge-triggered, one-shot epoll")]
#[command(version)]
struct Args {
    /// Address to listen on [env: ETUDE_HOST]
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on [env: ETUDE_PORT]
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory files are served from [env: ETUDE_DOC_ROOT]
    #[arg(short, long)]
    doc_root: Option<PathBuf>,

    /// Worker threads [env: ETUDE_WORKERS]
    #[arg(short, long)]
    workers: Option<usize>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging_with_level(&args.log_level);

    let mut config = Config::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(doc_root) = args.doc_root {
        config.doc_root = doc_root;
    }
    if let Some(workers) = args.workers.filter(|&n| n > 0) {
        config.workers = workers;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received SIGINT, shutting down");
        flag.store(true, Ordering::SeqCst);
    }) {
        error!(error = %e, "could not install Ctrl-C handler");
        return ExitCode::FAILURE;
    }

    match Server::new(config).shutdown_flag(shutdown).serve() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}
