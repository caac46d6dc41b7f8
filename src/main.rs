use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pictor::config::Config;
use pictor::indexer::{self, IndexOptions};
use pictor::{create_backend, logging, run_query, scanner, Database, QueryOptions};

#[derive(Debug, PartialEq)]
enum Mode {
    Scan(PathBuf),
    Describe,
    Embeddings,
    Query(String),
    Help,
    Version,
}

#[derive(Debug, PartialEq)]
struct Args {
    mode: Mode,
    config: Option<PathBuf>,
    db: Option<PathBuf>,
    count: Option<usize>,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut mode = None;
    let mut positional = Vec::new();
    let mut config = None;
    let mut db = None;
    let mut count = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => return Ok(Args { mode: Mode::Help, config, db, count }),
            "--version" | "-V" => return Ok(Args { mode: Mode::Version, config, db, count }),
            flag @ ("--config" | "-c" | "--db" | "--count") => {
                let Some(value) = args.get(i + 1) else {
                    bail!("{flag} requires an argument");
                };
                match flag {
                    "--db" => db = Some(PathBuf::from(value)),
                    "--count" => {
                        let n: i64 = value.parse().with_context(|| format!("invalid --count {value:?}"))?;
                        // Negative means no limit.
                        count = usize::try_from(n).ok();
                    }
                    _ => config = Some(PathBuf::from(value)),
                }
                i += 1;
            }
            arg if arg.starts_with('-') => bail!("unknown argument: {arg}"),
            arg if mode.is_none() => mode = Some(arg.to_string()),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mode = match mode.as_deref() {
        None => Mode::Help,
        Some("scan" | "sc") => match positional.as_slice() {
            [path] => Mode::Scan(PathBuf::from(path)),
            _ => bail!("scan takes exactly one library path"),
        },
        Some("describe" | "d") => Mode::Describe,
        Some("embeddings" | "e") => Mode::Embeddings,
        Some("query" | "q") => {
            if positional.is_empty() {
                bail!("query needs some text");
            }
            Mode::Query(positional.join(" "))
        }
        Some(other) => bail!("unknown mode: {other}"),
    };

    Ok(Args { mode, config, db, count })
}

fn print_help() {
    println!(
        r#"pictor - natural-language search over a photo library

USAGE:
    pictor <MODE> [ARGS] [OPTIONS]

MODES:
    scan, sc PATH       Add new images under PATH to the library
    describe, d         Describe images that have no description yet
    embeddings, e       Embed descriptions for the configured embedding model
    query, q TEXT       Show the best matches for TEXT

OPTIONS:
    --config, -c PATH   Path to config file
    --db PATH           Path to the library database
    --count N           Process at most N items (describe, embeddings)
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    PICTOR_CONFIG       Path to config file (overrides default location)
    PICTOR_LOG          Log filter (trace, debug, info, warn, error)
    OPENAI_API_KEY      API key for the openai backend

Config file location: $XDG_CONFIG_HOME/pictor/config.toml"#
    );
}

/// First Ctrl-C asks running work to stop; the second exits immediately.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted, finishing current item");
        eprintln!("Interrupted, stopping (Ctrl-C again to exit now)");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {e}");
            print_help();
            std::process::exit(2);
        }
    };

    match args.mode {
        Mode::Help => {
            print_help();
            return Ok(());
        }
        Mode::Version => {
            println!("pictor {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let _ = logging::init(None);

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(db) = args.db {
        config.db_path = db;
    }

    let db = Database::open(&config.db_path)
        .await
        .with_context(|| format!("opening library at {}", config.db_path.display()))?;

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let index_options = IndexOptions {
        limit: args.count,
        ..IndexOptions::from(&config.indexer)
    };

    match args.mode {
        Mode::Scan(root) => {
            let report = scanner::scan_library(&db, &root, &config.scanner, &cancel).await?;
            println!("Found {} images, {} new", report.found, report.inserted);
        }
        Mode::Describe => {
            let backend = create_backend(&config.backend)?;
            if !backend.is_healthy().await {
                bail!("{} backend is not reachable", backend.name());
            }
            let report = indexer::describe_pending(&db, backend.as_ref(), &index_options, &cancel).await?;
            println!(
                "Described {} of {} images ({} failed, {} missing)",
                report.processed, report.pending, report.failed, report.missing
            );
        }
        Mode::Embeddings => {
            let backend = create_backend(&config.backend)?;
            if !backend.is_healthy().await {
                bail!("{} backend is not reachable", backend.name());
            }
            let report = indexer::embed_missing(&db, backend.as_ref(), &index_options, &cancel).await?;
            println!(
                "Embedded {} of {} descriptions ({} failed)",
                report.processed, report.pending, report.failed
            );
        }
        Mode::Query(text) => {
            let backend = create_backend(&config.backend)?;
            let options = QueryOptions::from(&config.query);
            let results = run_query(&db, backend.as_ref(), &text, &options, &cancel).await?;
            if results.is_empty() {
                println!("No matches");
            }
            for r in results {
                println!(
                    "{:>2}  {:.4}  {}\n    {}",
                    r.rank,
                    r.score,
                    r.path,
                    r.description.as_deref().unwrap_or("")
                );
            }
        }
        Mode::Help | Mode::Version => {}
    }

    info!("Done");
    Ok(())
}
