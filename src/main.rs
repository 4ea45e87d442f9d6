use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use ragkit::client::RagClient;
use ragkit::config;
use ragkit::models::{IngestRequest, QueryRequest};

#[derive(Parser)]
#[command(
    name = "ragkit",
    about = "ragkit — a local-first retrieval-augmented generation platform",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./ragkit.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the store and task tables
    Init,

    /// Ingest a file, URL, or inline text
    Ingest {
        /// Local file to ingest
        #[arg(long)]
        file: Option<String>,
        /// URL to fetch and ingest
        #[arg(long)]
        url: Option<String>,
        /// Inline text to ingest
        #[arg(long)]
        text: Option<String>,
        /// Explicit document id
        #[arg(long)]
        id: Option<String>,
    },

    /// Ask a question against the store
    Query {
        question: String,
        /// Number of chunks to retrieve
        #[arg(long)]
        top_k: Option<usize>,
        /// Print the retrieved sources
        #[arg(long)]
        sources: bool,
        /// Stream the answer as it is generated
        #[arg(long)]
        stream: bool,
        /// Expose MCP tools to the model (comma-separated names)
        #[arg(long)]
        tools: Option<String>,
    },

    /// List stored documents
    List,

    /// Delete a document (cascades its chunks)
    Delete { id: String },

    /// Drop all documents, chunks, and embeddings
    Reset,

    /// Show store counts and component status
    Status,

    /// Manage scheduled tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Inspect MCP tool servers
    Mcp {
        #[command(subcommand)]
        command: McpCommands,
    },

    /// Run the scheduler and tool servers until interrupted
    Serve,
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Create a task
    Add {
        /// Task type: query, ingest, script, or tool
        #[arg(long)]
        r#type: String,
        /// Cron schedule (empty for one-shot)
        #[arg(long, default_value = "")]
        schedule: String,
        /// Parameters as key=value pairs
        #[arg(long)]
        param: Vec<String>,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List tasks
    List,
    /// Run a task immediately
    Run { id: String },
    /// Enable a task
    Enable { id: String },
    /// Disable a task
    Disable { id: String },
    /// Delete a task and its execution history
    Delete { id: String },
    /// Show recent executions of a task
    History {
        id: String,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum McpCommands {
    /// List configured servers and their state
    List,
    /// List discovered tools across running servers
    Tools,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        config::Config::default()
    };

    let client = RagClient::new(config).await?;
    let cancel = CancellationToken::new();

    match cli.command {
        Commands::Init => {
            // Opening the client ran the migrations already.
            println!("initialized store at {}", client.config().store.path.display());
        }

        Commands::Ingest {
            file,
            url,
            text,
            id,
        } => {
            let request = IngestRequest {
                content: text,
                file_path: file,
                url,
                document_id: id,
                ..IngestRequest::default()
            };
            let response = client.ingest(&request, &cancel).await?;
            println!("ingested document {}", response.document_id);
            println!("  chunks: {}", response.chunk_count);
        }

        Commands::Query {
            question,
            top_k,
            sources,
            stream,
            tools,
        } => {
            let mut request = QueryRequest {
                query: question,
                show_sources: sources,
                ..QueryRequest::default()
            };
            request.top_k = top_k.unwrap_or(client.config().query.top_k);
            request.max_tool_calls = client.config().query.max_tool_calls;
            if let Some(tools) = tools {
                request.tools_enabled = true;
                request.allowed_tools = tools.split(',').map(str::trim).map(String::from).collect();
                client.mcp().start_all().await?;
            }

            let response = if stream {
                let mut sink = |chunk: &str| {
                    print!("{chunk}");
                };
                let response = client.query_stream(&request, &mut sink, &cancel).await?;
                println!();
                response
            } else {
                let response = client.query(&request, &cancel).await?;
                println!("{}", response.answer);
                response
            };

            if sources {
                println!();
                for (i, chunk) in response.sources.iter().enumerate() {
                    let score = chunk.score.unwrap_or(0.0);
                    let excerpt: String = chunk.content.chars().take(120).collect();
                    println!(
                        "{}. [{:.3}] {} — \"{}\"",
                        i + 1,
                        score,
                        chunk.document_id,
                        excerpt.replace('\n', " ")
                    );
                }
            }
            if !response.tools_used.is_empty() {
                println!("tools used: {}", response.tools_used.join(", "));
            }
            println!("elapsed: {}ms", response.elapsed_ms);
        }

        Commands::List => {
            let documents = client.list_documents().await?;
            if documents.is_empty() {
                println!("No documents.");
            }
            for doc in documents {
                let source = doc
                    .path
                    .or(doc.url)
                    .unwrap_or_else(|| "(inline)".to_string());
                println!("{}  {}", doc.id, source);
            }
        }

        Commands::Delete { id } => {
            client.delete_document(&id).await?;
            println!("deleted {id}");
        }

        Commands::Reset => {
            client.reset().await?;
            println!("store reset");
        }

        Commands::Status => {
            let status = client.status().await?;
            println!("documents: {}", status.document_count);
            println!("chunks:    {}", status.chunk_count);
            match status.dimension {
                Some(dims) => println!("dims:      {dims}"),
                None => println!("dims:      (no vectors yet)"),
            }
            println!("embedder:  {}", status.embedder);
            println!("generator: {}", status.generator);
            println!("mcp:       {}", if status.mcp_enabled { "enabled" } else { "disabled" });
            println!(
                "scheduler: {}",
                if status.scheduler_enabled { "enabled" } else { "disabled" }
            );
        }

        Commands::Task { command } => run_task_command(&client, command, &cancel).await?,

        Commands::Mcp { command } => {
            client.mcp().start_all().await?;
            match command {
                McpCommands::List => {
                    for server in client.mcp().list_servers().await? {
                        println!(
                            "{}  {:?}  {} tools  ({} {})",
                            server.name,
                            server.state,
                            server.tool_count,
                            server.command,
                            server.args.join(" ")
                        );
                    }
                }
                McpCommands::Tools => {
                    for tool in client.mcp().list_tools().await? {
                        println!("{}  — {}", tool.name, tool.description);
                    }
                }
            }
            client.mcp().stop_all().await?;
        }

        Commands::Serve => {
            client.start().await?;
            println!("running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            client.shutdown().await?;
        }
    }

    Ok(())
}

async fn run_task_command(
    client: &RagClient,
    command: TaskCommands,
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        TaskCommands::Add {
            r#type,
            schedule,
            param,
            description,
        } => {
            let task_type: ragkit::scheduler::TaskType = r#type.parse()?;
            let mut parameters = HashMap::new();
            for pair in param {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("--param must be key=value, got '{pair}'"))?;
                parameters.insert(key.to_string(), value.to_string());
            }
            let task = client
                .scheduler()
                .create_task(task_type, &schedule, parameters, &description, 0)
                .await?;
            println!("created task {}", task.id);
            if let Some(next) = task.next_run {
                println!("  next run: {}", format_ts(next));
            } else {
                println!("  one-shot (run with `ragkit task run {}`)", task.id);
            }
        }
        TaskCommands::List => {
            let tasks = client.scheduler().list_tasks().await?;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in tasks {
                println!(
                    "{}  {}  [{}]  {}  next: {}",
                    task.id,
                    task.task_type.as_str(),
                    if task.enabled { "on" } else { "off" },
                    if task.schedule.is_empty() { "one-shot" } else { &task.schedule },
                    task.next_run.map_or_else(|| "-".to_string(), format_ts),
                );
            }
        }
        TaskCommands::Run { id } => {
            let execution = client.scheduler().run_task(&id, cancel).await?;
            println!("execution {}: {:?}", execution.id, execution.status);
            if let Some(output) = execution.output {
                println!("{output}");
            }
            if let Some(error) = execution.error {
                eprintln!("error: {error}");
            }
        }
        TaskCommands::Enable { id } => {
            client.scheduler().set_enabled(&id, true).await?;
            println!("enabled {id}");
        }
        TaskCommands::Disable { id } => {
            client.scheduler().set_enabled(&id, false).await?;
            println!("disabled {id}");
        }
        TaskCommands::Delete { id } => {
            client.scheduler().delete_task(&id).await?;
            println!("deleted {id}");
        }
        TaskCommands::History { id, limit } => {
            let executions = client.scheduler().list_executions(&id, limit).await?;
            if executions.is_empty() {
                println!("No executions.");
            }
            for execution in executions {
                println!(
                    "{}  {:?}  {}ms  {}",
                    format_ts(execution.start),
                    execution.status,
                    execution.duration_ms,
                    execution
                        .error
                        .or(execution.output)
                        .unwrap_or_default()
                        .replace('\n', " ")
                );
            }
        }
    }
    Ok(())
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
