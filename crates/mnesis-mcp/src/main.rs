//! Mnesis MCP Server
//!
//! Local-first personal memory over the Model Context Protocol:
//!
//! - Serialized write pipeline over a vector-capable SQLite store
//! - Exact + semantic dedup, conflict detection, versioning, soft delete
//! - Conversation mining with a durable candidate store and job queue
//! - Ebbinghaus decay sweeps and a typed knowledge graph
//!
//! stdout carries JSON-RPC frames; all logging goes to stderr.

mod protocol;
mod server;
mod tools;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use mnesis_core::{
    ConfigHandle, ConflictWorkbench, EmbeddingService, JobQueue, JobWorker, MemoryCore, Miner,
    Scheduler, Store, WriteQueue,
};

use crate::protocol::stdio::StdioTransport;
use crate::server::McpServer;
use crate::tools::ToolContext;

/// Parse command-line arguments and return the optional database path.
/// Exits the process for `--help` / `--version`.
fn parse_args() -> Option<PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    let mut data_dir: Option<PathBuf> = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                println!("Mnesis MCP Server v{}", env!("CARGO_PKG_VERSION"));
                println!();
                println!("Personal memory server using the Model Context Protocol.");
                println!();
                println!("USAGE:");
                println!("    mnesis-mcp [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help              Print help information");
                println!("    -V, --version           Print version information");
                println!("    --data-dir <PATH>       Custom data directory");
                println!();
                println!("ENVIRONMENT:");
                println!("    RUST_LOG                Log level filter (debug, info, warn, error)");
                println!("    MNESIS_DATA_DIR         Overrides the config/data directory");
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("mnesis-mcp {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--data-dir" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --data-dir requires a path argument");
                    std::process::exit(1);
                }
                data_dir = Some(PathBuf::from(&args[i]));
            }
            arg if arg.starts_with("--data-dir=") => {
                let path = arg.strip_prefix("--data-dir=").unwrap_or("");
                if path.is_empty() {
                    eprintln!("error: --data-dir requires a path argument");
                    std::process::exit(1);
                }
                data_dir = Some(PathBuf::from(path));
            }
            arg => {
                eprintln!("error: unknown argument '{arg}'");
                eprintln!("Try 'mnesis-mcp --help' for more information.");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    data_dir
}

#[tokio::main]
async fn main() {
    let data_dir = parse_args();

    // Logging to stderr (stdout is for JSON-RPC).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();

    info!("Mnesis MCP Server v{} starting...", env!("CARGO_PKG_VERSION"));

    let db_path = data_dir.map(|dir| dir.join(mnesis_core::storage::DEFAULT_DB_FILE));
    let store = match Store::open(db_path) {
        Ok(store) => {
            info!("Store initialized at {}", store.db_path().display());
            Arc::new(store)
        }
        Err(e) => {
            error!("Failed to initialize store: {}", e);
            std::process::exit(1);
        }
    };

    let embedder = Arc::new(EmbeddingService::new());
    {
        // Warm the embedding model in the background; writes fall back to
        // zero-vector paths until it is ready.
        let embedder = embedder.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = embedder.init() {
                warn!("Embedding model unavailable: {}", e);
                warn!("Dedup and semantic search degrade until the model loads");
            } else {
                info!("Embedding model ready ({})", embedder.model_name());
            }
        });
    }

    let config = Arc::new(ConfigHandle::new());
    let queue = WriteQueue::start(store.clone());
    let core = Arc::new(MemoryCore::new(store.clone(), embedder.clone(), queue.clone()));
    let workbench = Arc::new(ConflictWorkbench::new(store.clone()));
    let miner = Arc::new(Miner::new(
        store.clone(),
        core.clone(),
        embedder.clone(),
        config.clone(),
    ));
    let jobs = JobQueue::new(store.clone(), queue.clone());

    // Background workers: job loop (with crash recovery) and the periodic
    // scheduler.
    JobWorker::new(jobs.clone(), miner.clone()).spawn();
    Scheduler::new(queue.clone(), config.clone(), jobs.clone()).spawn();

    let session_id = match core.sessions().start_session("mcp", None) {
        Ok(id) => id,
        Err(e) => {
            warn!("Failed to open session row: {}", e);
            uuid::Uuid::new_v4().to_string()
        }
    };

    let server = McpServer::new(ToolContext {
        core,
        workbench,
        miner,
        jobs,
        session_id,
    });

    info!("Starting MCP server on stdio...");
    if let Err(e) = StdioTransport::new().run(server).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("Mnesis MCP Server shutting down");
}
