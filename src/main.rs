use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use contextfs::commands::{self, Output};
use contextfs::config::Config;
use contextfs::fsstore::Store;
use contextfs::retrieval::Scope;
use contextfs::state::State;
use std::path::PathBuf;
use std::str::FromStr;

fn parse_scope(raw: &str) -> Result<Scope> {
    Scope::from_str(raw).map_err(|e| anyhow::anyhow!(e.to_string()))
}

#[derive(Parser, Debug)]
#[command(
    name = "ctx",
    about = "Per-workspace conversational memory for long-running LLM-agent sessions",
    long_about = None,
)]
struct Args {
    /// Workspace directory (defaults to the current directory)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Emit machine-readable JSON instead of human text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show effective configuration
    Ls,
    /// Show store statistics (turn counts, pins, revision)
    Stats,
    /// Print the current pack block
    Cat,
    /// Add a pinned constraint
    Pin { text: String },
    /// Explicitly save a turn to memory, outside normal compaction
    Save {
        text: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        role: Option<String>,
        #[arg(long = "type")]
        kind: Option<String>,
        #[arg(long)]
        session: Option<String>,
    },
    /// Roll old turns into the archive, folding a summary
    Compact {
        #[arg(long)]
        force: bool,
    },
    /// Search turns lexically (and vectorially, in hybrid mode)
    Search {
        query: String,
        #[arg(short, long)]
        k: Option<usize>,
        #[arg(long, default_value = "all")]
        scope: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// Show turns around an anchor id
    Timeline {
        id: String,
        #[arg(long)]
        before: Option<usize>,
        #[arg(long)]
        after: Option<usize>,
        #[arg(long, default_value = "all")]
        scope: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// Fetch a turn's full text by id
    Get {
        id: String,
        #[arg(long)]
        head: Option<usize>,
        #[arg(long, default_value = "all")]
        scope: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// List recent retrieval traces
    Traces {
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Show a single retrieval trace by id
    Trace { id: String },
    /// Quarantine malformed hot-log lines
    Gc,
    /// Rebuild the derived lexical/vector index from scratch
    Reindex,
    /// Run the stdio JSON-RPC tool server
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let workspace = args.workspace.unwrap_or_else(|| PathBuf::from("."));
    let cfg = Config::load(&workspace).context("loading contextfs.toml")?;
    let contextfs_dir = cfg.contextfs_dir_path(&workspace);
    let store = Store::open(&contextfs_dir).context("opening .contextfs store")?;

    let output = run(&store, &cfg, args.command).await?;
    if let Some(output) = output {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            println!("{}", output.to_text());
        }
    }
    Ok(())
}

async fn run(store: &Store, cfg: &Config, command: Command) -> Result<Option<Output>> {
    let out = match command {
        Command::Ls => Some(commands::ls(cfg)),
        Command::Stats => Some(commands::stats(store, cfg)?),
        Command::Cat => {
            let state = State::read(store)?;
            Some(commands::cat(store, cfg, &state)?)
        }
        Command::Pin { text } => Some(commands::pin_add(store, cfg, &text)?),
        Command::Save { text, title, role, kind, session } => Some(
            commands::save(
                store,
                cfg,
                &text,
                title.as_deref(),
                role.as_deref(),
                kind.as_deref(),
                session.as_deref(),
            )
            .await?,
        ),
        Command::Compact { force } => Some(commands::compact(store, cfg, force).await?),
        Command::Search { query, k, scope, session } => Some(
            commands::search(store, cfg, &query, k, parse_scope(&scope)?, session.as_deref()).await?,
        ),
        Command::Timeline { id, before, after, scope, session } => Some(commands::timeline(
            store,
            cfg,
            &id,
            before,
            after,
            parse_scope(&scope)?,
            session.as_deref(),
        )?),
        Command::Get { id, head, scope, session } => Some(commands::get(
            store,
            cfg,
            &id,
            head,
            parse_scope(&scope)?,
            session.as_deref(),
        )?),
        Command::Traces { tail } => Some(commands::traces_tail(store, cfg, tail)?),
        Command::Trace { id } => Some(commands::trace_by_id(store, &id)?),
        Command::Gc => Some(commands::gc(store)?),
        Command::Reindex => Some(commands::reindex(store, cfg).await?),
        Command::Serve => {
            let stdin = tokio::io::stdin();
            let stdout = tokio::io::stdout();
            contextfs::rpc::serve(store, cfg, stdin, stdout).await?;
            None
        }
    };
    Ok(out)
}
