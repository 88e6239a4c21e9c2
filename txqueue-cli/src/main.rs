use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use txqueue_engine::{
    Backend, EngineConfig, LoggingConfig, Payload, QueueSession, TransactionalQueueManager,
};

#[derive(Parser, Debug)]
#[command(name = "txqueue")]
#[command(about = "txqueue - inspect and drive a transactional queue store", long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured backend
    #[arg(short, long, value_enum)]
    backend: Option<BackendArg>,

    /// Override the configured store directory
    #[arg(short, long)]
    path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List recovered queues and their sizes
    Inspect {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Durably put one payload on a queue
    Put {
        #[arg(short, long)]
        queue: String,
        /// Parse the payload as JSON and store it as an object
        #[arg(long)]
        json: bool,
        payload: String,
    },
    /// Take payloads off the head of a queue
    Take {
        #[arg(short, long)]
        queue: String,
        /// Number of payloads to take
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
        /// Take inside a transaction and roll it back, leaving the queue unchanged
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    Memory,
    File,
    Journal,
    Log,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Memory => Backend::Memory,
            BackendArg::File => Backend::File,
            BackendArg::Journal => Backend::Journal,
            BackendArg::Log => Backend::Log,
        }
    }
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(backend) = args.backend {
        config.persistence.backend = backend.into();
    }
    if let Some(path) = &args.path {
        config.persistence.path = path.clone();
    }
    Ok(config)
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stdout)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stdout)
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

fn render(payload: &Payload) -> String {
    match payload {
        Payload::Text(text) => text.clone(),
        Payload::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => format!("(bytes) {}", text),
            Err(_) => format!("(bytes) {} bytes", bytes.len()),
        },
        Payload::Object(value) => value.to_string(),
    }
}

fn inspect(manager: &Arc<TransactionalQueueManager>, config: &EngineConfig, as_json: bool) -> Result<()> {
    let session = manager.session();
    let names = manager.queue_names();

    if as_json {
        let mut queues = Vec::with_capacity(names.len());
        for name in &names {
            queues.push(json!({ "name": name, "size": session.queue(name.as_str()).size()? }));
        }
        let report = json!({
            "backend": manager.persistence().name(),
            "path": config.persistence.path,
            "queues": queues,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    info!(
        "{} {} at {}",
        "Store".bold().cyan(),
        manager.persistence().name(),
        config.persistence.path.display()
    );
    if names.is_empty() {
        info!("{}", "(no queues)".dimmed());
    }
    for name in &names {
        let queue = session.queue(name.as_str());
        let head = queue
            .peek()?
            .map(|p| render(&p))
            .unwrap_or_else(|| "-".to_string());
        info!("  {:<24} {:>8}  head: {}", name.bold(), queue.size()?, head);
    }
    Ok(())
}

fn take(session: &QueueSession, queue_name: &str, count: usize, dry_run: bool) -> Result<()> {
    let queue = session.queue(queue_name);
    if dry_run {
        session.begin()?;
    }

    let mut taken = 0;
    for _ in 0..count {
        match queue.take()? {
            Some(payload) => {
                info!("{}", render(&payload));
                taken += 1;
            }
            None => {
                info!("{}", "(empty)".dimmed());
                break;
            }
        }
    }

    if dry_run {
        session.rollback()?;
        info!("{}", format!("{} payloads returned to {}", taken, queue_name).yellow());
    }
    Ok(())
}

fn run(args: Args, config: EngineConfig) -> Result<()> {
    let start = Instant::now();
    let manager = config.build_manager();
    manager
        .start()
        .with_context(|| format!("failed to open store at {}", config.persistence.path.display()))?;
    let session = manager.session();

    match &args.command {
        Command::Inspect { json } => inspect(&manager, &config, *json)?,
        Command::Put {
            queue,
            json,
            payload,
        } => {
            let payload = if *json {
                Payload::Object(serde_json::from_str(payload).context("payload is not valid JSON")?)
            } else {
                Payload::from(payload.as_str())
            };
            session.queue(queue.as_str()).put(payload)?;
            info!("{}", "OK".green());
        }
        Command::Take {
            queue,
            count,
            dry_run,
        } => take(&session, queue, *count, *dry_run)?,
    }

    manager.stop()?;
    info!("{}", format!("({:.2?})", start.elapsed()).dimmed());
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config.logging);

    if let Err(e) = run(args, config) {
        error!(error = %e, "{}", format!("Error: {:#}", e).red());
        std::process::exit(1);
    }
    Ok(())
}
