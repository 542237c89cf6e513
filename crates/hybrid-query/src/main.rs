//! # Hybrid Query CLI (`hq`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hq init` | Create the vector store database and its tables |
//! | `hq schema` | Print the target database schema as the engine sees it |
//! | `hq populate` | Embed database rows into the vector store |
//! | `hq ask "<question>"` | Answer one question |
//! | `hq chat` | Interactive conversation over stdin |
//! | `hq serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! hq init --config ./config/hq.toml
//! hq populate --config ./config/hq.toml
//! hq ask "What did the top customer buy last month?" --config ./config/hq.toml
//! RUST_LOG=hybrid_query=debug hq chat --config ./config/hq.toml
//! ```

use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hybrid_query::config::load_config;
use hybrid_query::engine::{build_engine, TurnOutcome};
use hybrid_query::session::CancellationToken;
use hybrid_query::{ingest, migrate, schema_cache, server};

/// Hybrid Query: answer questions over a SQL database and a vector store.
#[derive(Parser)]
#[command(
    name = "hq",
    about = "Hybrid Query: natural-language questions over SQL and vector retrieval",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/hq.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the vector store schema (idempotent).
    Init,

    /// Print the tables and columns of the target database.
    Schema,

    /// Embed every database row not yet in the vector store.
    Populate,

    /// Ask a single question.
    Ask {
        question: String,

        /// Session id; questions sharing one see each other's history.
        #[arg(long, default_value = "cli")]
        session: String,

        /// Print the generated SQL and the fused context.
        #[arg(long)]
        explain: bool,
    },

    /// Interactive conversation. `/clear` resets history, `/quit` exits.
    Chat {
        #[arg(long)]
        explain: bool,
    },

    /// Start the HTTP API server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&config).await?;
            println!("Vector store initialized at {}", config.store.path.display());
        }
        Commands::Schema => {
            let pool = hybrid_query::db::connect_target(&config.database.path).await?;
            let snapshot = schema_cache::introspect(&pool, &config.database.tables).await?;
            if snapshot.is_empty() {
                println!("(no tables)");
            }
            for table in &snapshot.tables {
                println!("{}", table.describe());
            }
            pool.close().await;
        }
        Commands::Populate => {
            ingest::run_populate(&config).await?;
        }
        Commands::Ask {
            question,
            session,
            explain,
        } => {
            let (engine, _schema) = build_engine(&config).await?;
            let outcome = engine
                .ask(&session, &question, &CancellationToken::new())
                .await?;
            print_outcome(&outcome, explain);
        }
        Commands::Chat { explain } => {
            let (engine, _schema) = build_engine(&config).await?;
            let session = engine.create_session();
            let stdin = std::io::stdin();
            let mut lines = stdin.lock().lines();
            loop {
                print!("> ");
                std::io::stdout().flush()?;
                let Some(line) = lines.next() else { break };
                let line = line?;
                match line.trim() {
                    "" => continue,
                    "/quit" | "/exit" => break,
                    "/clear" => {
                        engine.end_session(&session);
                        println!("(history cleared)");
                        continue;
                    }
                    question => {
                        match engine.ask(&session, question, &CancellationToken::new()).await {
                            Ok(outcome) => print_outcome(&outcome, explain),
                            Err(e) => eprintln!("error: {}", e),
                        }
                    }
                }
            }
        }
        Commands::Serve => {
            server::run_server(&config).await?;
        }
    }

    Ok(())
}

fn print_outcome(outcome: &TurnOutcome, explain: bool) {
    println!("{}", outcome.answer);
    if !outcome.provenance.is_empty() {
        println!();
        println!("sources: {}", outcome.provenance.join(", "));
    }
    if explain {
        println!();
        match &outcome.generated_query {
            Some(q) => {
                println!("sql ({}): {}", q.status, q.sql);
                if let Some(reason) = &q.reason {
                    println!("  reason: {}", reason);
                }
            }
            None => println!("sql: (none)"),
        }
        for cand in &outcome.context {
            println!(
                "  #{} [{}] {} score={:.3}",
                cand.rank, cand.source, cand.id, cand.score
            );
        }
    }
}
