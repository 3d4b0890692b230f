use clap::{Parser, Subcommand, ValueEnum};
use deepcapture_rs::capture::Capture;
use deepcapture_rs::config::{BackendPreference, Config};
use deepcapture_rs::recorder::{Recorder, RunStore};
use deepcapture_rs::replay::Replay;
use deepcapture_rs::sink::ChannelSink;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "deepcapture-rs")]
#[command(about = "Reconstruct browser network traffic from debugger and webRequest event logs")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a recorded event log and print one entry per line
    Replay {
        file: String,

        /// Force a backend instead of picking from the recording
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,

        #[arg(long)]
        max_body_bytes: Option<usize>,

        /// Print the run summary after the entries
        #[arg(long)]
        summary: bool,

        /// Keep the run in the run store
        #[arg(long)]
        save: bool,
    },

    /// Inspect saved runs
    #[command(subcommand)]
    Runs(RunsCommand),

    /// Write the default configuration to a file
    InitConfig { path: String },
}

#[derive(Subcommand, Debug)]
enum RunsCommand {
    /// List saved runs, newest first
    List,
    /// Print a saved run (the latest when no key is given)
    Show { key: Option<String> },
    /// Delete a saved run
    Delete { key: String },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    Protocol,
    WebRequest,
}

impl From<BackendArg> for BackendPreference {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Protocol => BackendPreference::Protocol,
            BackendArg::WebRequest => BackendPreference::WebRequest,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries entries
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Replay {
            file,
            backend,
            max_body_bytes,
            summary,
            save,
        } => {
            if let Some(backend) = backend {
                config.backend = backend.into();
            }
            if max_body_bytes.is_some() {
                config.max_body_bytes = max_body_bytes;
            }
            replay(&config, &file, summary, save).await
        }
        Commands::Runs(command) => runs(&config, command),
        Commands::InitConfig { path } => {
            config.to_file(&path)?;
            info!("Wrote configuration to {}", path);
            Ok(())
        }
    }
}

async fn replay(config: &Config, file: &str, summary: bool, save: bool) -> anyhow::Result<()> {
    let replay = Replay::from_file(file)?;
    let (sink, mut rx) = ChannelSink::new();
    let Some(mut capture) = Capture::select(&replay.capabilities(), Arc::new(sink), config)? else {
        anyhow::bail!("{} holds no traffic a capture backend can consume", file);
    };

    let mut recorder = Recorder::new(config);
    recorder.start();

    let stats = replay.run(&mut capture).await?;
    let pending = capture.pending_requests();
    capture.detach_all().await;
    drop(capture);

    while let Some(captured) = rx.recv().await {
        println!("{}", serde_json::to_string(&captured.entry)?);
        recorder.ingest_captured(captured);
    }

    let run = recorder.stop()?;
    info!(
        "Replayed {} records: {} dispatched, {} skipped, {} left unfinished",
        stats.records, stats.dispatched, stats.skipped, pending
    );
    if summary {
        println!("{}", serde_json::to_string(&run.summary)?);
    }
    if save {
        let path = RunStore::from_config(config).save(&run)?;
        info!("Saved {} to {}", run.key, path.display());
    }
    Ok(())
}

fn runs(config: &Config, command: RunsCommand) -> anyhow::Result<()> {
    let store = RunStore::from_config(config);
    match command {
        RunsCommand::List => {
            for (key, summary) in store.list()? {
                println!(
                    "{}  events={} pages={} bytes={}",
                    key, summary.total_events, summary.pages_count, summary.total_bytes
                );
            }
        }
        RunsCommand::Show { key } => {
            let run = match key {
                Some(key) => Some(store.load(&key)?),
                None => store.latest()?,
            };
            match run {
                Some(run) => println!("{}", serde_json::to_string_pretty(&run)?),
                None => anyhow::bail!("no saved runs"),
            }
        }
        RunsCommand::Delete { key } => {
            store.delete(&key)?;
            info!("Deleted {}", key);
        }
    }
    Ok(())
}
