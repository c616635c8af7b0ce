//! Docent CLI: ask questions about a folder of documents from the terminal.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Docent: grounded answers from your documents
#[derive(Parser, Debug)]
#[command(name = "docent", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (reads `.docent/config.toml` from here)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Answer a question from the documents in a directory
    Ask {
        /// The question
        question: String,
        /// Directory of `.txt`/`.md` documents (form feeds separate pages)
        #[arg(short, long)]
        docs: PathBuf,
        /// Conversation id for follow-up questions
        #[arg(short, long, default_value = "cli")]
        conversation: String,
        /// Answer language (en, hi, mr, ...); detected from the question if omitted
        #[arg(short, long)]
        lang: Option<String>,
        /// Print the answer as it is generated
        #[arg(long)]
        stream: bool,
        /// Print the full answer record as JSON
        #[arg(long, conflicts_with = "stream")]
        json: bool,
    },
    /// Show how the query gate tags a message
    Classify {
        /// The message to classify
        query: String,
    },
    /// Translate text through the configured translator process
    Translate {
        /// Text to translate
        text: String,
        #[arg(long, default_value = "en")]
        from: String,
        #[arg(long, default_value = "hi")]
        to: String,
        /// Translator command line, overriding `translation.command`
        #[arg(long)]
        command: Option<String>,
        /// Print units as they are translated
        #[arg(long)]
        stream: bool,
        /// Skip scientific-term locking
        #[arg(long)]
        no_glossary: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default workspace configuration file
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "docent", "docent")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "docent.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("docent_core=debug,docent=debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace).await
}
