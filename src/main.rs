use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chainflow_core::config::AppConfig;
use chainflow_core::stream::StreamEvent;
use chainflow_core::traits::HistoryStore;
use chainflow_core::types::SessionId;

use chainflow_engine::{Engine, EngineRequest, EngineResponse, GraphDefinition, SessionRunner};
use chainflow_gateway::GatewayServer;
use chainflow_memory::SqliteHistoryStore;
use chainflow_nodes::builtin_registry;

#[derive(Parser)]
#[command(name = "chainflow", version, about = "Run declarative LLM chain graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "chainflow.toml")]
    config: PathBuf,

    /// Session ID (auto-generated if not provided)
    #[arg(short, long)]
    session: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a graph once against a single input
    Run {
        /// Graph definition (JSON)
        #[arg(short, long)]
        graph: PathBuf,
        /// Print chunks as they arrive
        #[arg(long)]
        stream: bool,
        /// The input to send; read from stdin when empty
        #[arg(trailing_var_arg = true)]
        input: Vec<String>,
    },
    /// Chat with a graph interactively
    Repl {
        /// Graph definition (JSON)
        #[arg(short, long)]
        graph: PathBuf,
    },
    /// Check a graph and print its execution order
    Validate {
        /// Graph definition (JSON)
        #[arg(short, long)]
        graph: PathBuf,
    },
    /// List the registered node types
    Types {
        /// Print full schemas as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show stored history for the session
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show current configuration
    Config,
    /// Start the HTTP gateway server
    Serve,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chainflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Completions don't need config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "chainflow", &mut io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let session_id = cli
        .session
        .as_deref()
        .map(SessionId::from_string)
        .unwrap_or_else(SessionId::new);

    let engine = Engine::new(builtin_registry(), config.engine.clone());

    match &cli.command {
        Commands::Types { json } => {
            print_types(&engine, *json)?;
            return Ok(());
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            return Ok(());
        }
        Commands::Validate { graph } => {
            let definition = load_graph(graph)?;
            match engine.validate(&definition) {
                Ok((_, plan)) => {
                    println!("Order:    {}", plan.order.join(" -> "));
                    println!("Terminal: {}", plan.terminal);
                }
                Err(e) => {
                    eprintln!("{}: {}", e.kind(), e);
                    std::process::exit(1);
                }
            }
            return Ok(());
        }
        _ => {}
    }

    let db_path = config.database_path();
    let store = Arc::new(
        SqliteHistoryStore::open(&db_path)
            .with_context(|| format!("opening history store at {}", db_path.display()))?,
    );
    let runner = SessionRunner::new(engine, store.clone());

    match cli.command {
        Commands::Run {
            graph,
            stream,
            input,
        } => {
            let definition = load_graph(&graph)?;
            let mut text = input.join(" ");
            if text.is_empty() {
                text = io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            let request = EngineRequest::new(definition, text).with_session(session_id.0.clone());
            let ok = if stream {
                run_streaming(&runner, request).await?
            } else {
                run_once(&runner, request).await
            };
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Repl { graph } => {
            let definition = load_graph(&graph)?;
            run_repl(&runner, &definition, &session_id).await?;
        }
        Commands::History { limit } => {
            let messages = store.load_history(&session_id, limit).await?;
            if messages.is_empty() {
                println!("No history for session {}", session_id);
            }
            for message in messages {
                println!("[{}] {}", message.role.as_str(), message.content);
            }
        }
        Commands::Serve => {
            let gateway = config.gateway.clone().unwrap_or_default();
            let server = GatewayServer::new(gateway, runner);

            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutting down gateway...");
                    cancel_clone.cancel();
                }
            });

            server.run(cancel).await?;
        }
        Commands::Types { .. }
        | Commands::Config
        | Commands::Validate { .. }
        | Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_graph(path: &Path) -> anyhow::Result<GraphDefinition> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing graph {}", path.display()))
}

fn print_types(engine: &Engine, json: bool) -> anyhow::Result<()> {
    let schemas = engine.registry().schemas();
    if json {
        println!("{}", serde_json::to_string_pretty(&schemas)?);
        return Ok(());
    }
    for schema in schemas {
        let marker = if schema.executable { "*" } else { " " };
        println!("{} {:<24} [{}] {}", marker, schema.name, schema.category, schema.label);
        let caps: Vec<&str> = schema.capabilities.iter().map(String::as_str).collect();
        println!("    provides: {}", caps.join(", "));
        for port in &schema.inputs {
            let accepted: Vec<&str> = port.accepted.iter().map(String::as_str).collect();
            let flags = match (port.required, port.list) {
                (true, true) => " (required, list)",
                (true, false) => " (required)",
                (false, true) => " (list)",
                (false, false) => "",
            };
            println!("    in  {:<20} {}{}", port.name, accepted.join(" | "), flags);
        }
        if schema.outputs.len() > 1 {
            for port in &schema.outputs {
                println!("    out {}", port.name);
            }
        }
    }
    Ok(())
}

/// Run without streaming and print the output. Returns false on failure.
async fn run_once(runner: &SessionRunner, request: EngineRequest) -> bool {
    let (session, response) = runner.handle(request).await;
    match response {
        EngineResponse::Success { output } => {
            println!("{}", output.as_text());
            true
        }
        failure => {
            error!(session_id = %session, "Run failed");
            match serde_json::to_string_pretty(&failure) {
                Ok(body) => eprintln!("{}", body),
                Err(e) => eprintln!("{:?} ({})", failure, e),
            }
            false
        }
    }
}

/// Run with streaming, printing chunks as they arrive.
async fn run_streaming(runner: &SessionRunner, request: EngineRequest) -> anyhow::Result<bool> {
    let (_, mut receiver) = runner.stream(request).await?;
    let mut stdout = io::stdout();
    while let Some(event) = receiver.recv().await {
        match event {
            StreamEvent::Chunk { chunk } => {
                print!("{}", chunk);
                stdout.flush()?;
            }
            StreamEvent::Done { .. } => {
                println!();
                return Ok(true);
            }
            StreamEvent::Error {
                error_kind,
                node_id,
                message,
            } => {
                println!();
                match node_id {
                    Some(node) => eprintln!("{} at {}: {}", error_kind, node, message),
                    None => eprintln!("{}: {}", error_kind, message),
                }
                return Ok(false);
            }
        }
    }
    warn!("Stream closed without a completion marker");
    Ok(false)
}

async fn run_repl(
    runner: &SessionRunner,
    definition: &GraphDefinition,
    session_id: &SessionId,
) -> anyhow::Result<()> {
    let (_, plan) = runner
        .engine()
        .validate(definition)
        .map_err(|e| anyhow::anyhow!("{}: {}", e.kind(), e))?;

    println!("Chainflow v{}", env!("CARGO_PKG_VERSION"));
    println!("Session: {}", session_id);
    println!("Graph: {}", plan.order.join(" -> "));
    println!("Type /help for commands, /quit to exit.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break; // EOF
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" | "/q" => {
                println!("Goodbye!");
                break;
            }
            "/session" => {
                println!("Session ID: {}", session_id);
                continue;
            }
            "/forget" => {
                let evicted = runner.forget(session_id).await?;
                println!("History cleared, {} cached instance(s) evicted.", evicted);
                continue;
            }
            "/help" => {
                println!("/session  show the session id");
                println!("/forget   clear this session's history");
                println!("/quit     exit");
                continue;
            }
            _ => {}
        }

        let request = EngineRequest::new(definition.clone(), input)
            .with_session(session_id.0.clone());
        run_streaming(runner, request).await?;
    }

    Ok(())
}
