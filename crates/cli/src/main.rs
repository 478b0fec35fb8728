mod attach;
mod config;
mod error;

use std::fmt;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mcp::ServerConfig;
use registry::ToolDescriptor;
use runtime::{
    DecisionProvider, DirectOnly, GeminiBackend, HttpTransport, PendingCall, Session,
    SessionState, StdioTransport, ToolCall, Transport,
};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use attach::Attachments;
use config::{Config, ConfigError, TransportKind};
use error::{Error, Result};

#[derive(Parser)]
#[command(name = "toolcall")]
#[command(about = "Discover and invoke remote tools, optionally through a language model", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the client configuration
    #[arg(short, long, default_value = "toolcall.toml", global = true)]
    config: PathBuf,

    /// Transport to the tool host (overrides [transport] kind)
    #[arg(long, value_enum, global = true)]
    transport: Option<TransportKind>,

    /// Tool host URL for the http transport
    #[arg(long, global = true)]
    url: Option<String>,

    /// Tool host command line for the stdio transport
    #[arg(long, global = true)]
    server_cmd: Option<String>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive session
    Chat {
        /// Attach a file to binary tool arguments ([field=]path)
        #[arg(short, long)]
        attach: Vec<String>,
    },
    /// List the tools published by the tool host
    Tools,
    /// Invoke a tool directly, without a language model
    Call {
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Attach a file to binary tool arguments ([field=]path)
        #[arg(short, long)]
        attach: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let config = Config::load_or_default(&cli.config)?;
    let transport = build_transport(&cli, &config)?;

    match cli.command.unwrap_or(Commands::Chat { attach: Vec::new() }) {
        Commands::Chat { attach } => {
            let backend = build_backend(&config)?;
            cmd_chat(transport, backend, Attachments::parse(&attach)?).await
        }
        Commands::Tools => cmd_tools(transport).await,
        Commands::Call { tool, args, attach } => {
            cmd_call(transport, &tool, &args, Attachments::parse(&attach)?).await
        }
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn build_backend(config: &Config) -> Result<GeminiBackend> {
    let provider = &config.provider;
    let mut builder = GeminiBackend::builder(config.api_key()?, &provider.model).mode(provider.mode);
    if let Some(base_url) = &provider.base_url {
        builder = builder.base_url(base_url);
    }
    Ok(builder.build()?)
}

fn build_transport(cli: &Cli, config: &Config) -> Result<AnyTransport> {
    let settings = &config.transport;
    let timeout = Duration::from_secs(settings.timeout_secs);

    match cli.transport.unwrap_or(settings.kind) {
        TransportKind::Http => {
            let url = cli.url.clone().unwrap_or_else(|| settings.base_url.clone());
            Ok(AnyTransport::Http(HttpTransport::new(url).call_timeout(timeout)))
        }
        TransportKind::Stdio => {
            let (command, args) = match &cli.server_cmd {
                Some(line) => {
                    let mut words = line.split_whitespace().map(String::from);
                    let command = words.next().ok_or(ConfigError::MissingCommand)?;
                    (command, words.collect())
                }
                None => (
                    settings.command.clone().ok_or(ConfigError::MissingCommand)?,
                    settings.args.clone(),
                ),
            };
            let server = ServerConfig {
                name: command.clone(),
                command,
                args,
                env: settings.env.clone(),
            };
            Ok(AnyTransport::Stdio(
                StdioTransport::spawn(server).call_timeout(timeout),
            ))
        }
    }
}

async fn cmd_chat(transport: AnyTransport, backend: GeminiBackend, attachments: Attachments) -> Result<()> {
    println!("toolcall v{}", env!("CARGO_PKG_VERSION"));
    println!("Provider: {backend}");

    let mut session = Session::new(transport, backend).with_hook(attachments);
    session.connect().await?;
    println!("Connected: {}", session.transport());
    print_tools(session.tools());
    println!("Type 'quit' or Ctrl+D to exit.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            break;
        }

        match session.handle(input).await {
            Ok(turn) => {
                if let Some(exchange) = &turn.exchange {
                    println!("Tool selected: {}", exchange.call.tool_name);
                }
                println!("\n{}\n", turn.text);
            }
            Err(e) => {
                eprintln!("Error: {e}\n");
                if e.is_fatal() || session.state() == SessionState::Closed {
                    break;
                }
            }
        }
    }

    session.close().await;
    println!("\nSession ended.");
    Ok(())
}

async fn cmd_tools(transport: AnyTransport) -> Result<()> {
    let mut session = Session::new(transport, DirectOnly);
    let result = session.connect().await.map(print_tools);
    session.close().await;
    Ok(result?)
}

async fn cmd_call(transport: AnyTransport, tool: &str, args: &str, attachments: Attachments) -> Result<()> {
    let arguments = match serde_json::from_str::<Value>(args)? {
        Value::Object(arguments) => arguments,
        other => {
            return Err(Error::InvalidArgument(format!(
                "--args must be a JSON object, got: {other}"
            )));
        }
    };

    let mut session = Session::new(transport, DirectOnly).with_hook(attachments);
    let result = invoke_once(&mut session, tool, arguments).await;
    session.close().await;

    let text = result?;
    println!("{text}");
    Ok(())
}

async fn invoke_once<D: DecisionProvider>(
    session: &mut Session<AnyTransport, D>,
    tool: &str,
    arguments: registry::Arguments,
) -> Result<String> {
    session.connect().await?;
    let exchange = session.invoke(tool, arguments).await?;
    info!(tool, correlation_id = %exchange.call.correlation_id, "tool returned");
    let payload = exchange.payload().cloned().unwrap_or_default();
    Ok(serde_json::to_string_pretty(&payload)?)
}

fn print_tools(tools: &[ToolDescriptor]) {
    println!("Discovered {} tool(s):", tools.len());
    for tool in tools {
        let params: Vec<_> = tool
            .parameter_schema
            .properties
            .keys()
            .map(|name| {
                if tool.parameter_schema.required.contains(name) {
                    format!("{name}*")
                } else {
                    name.clone()
                }
            })
            .collect();
        println!("  {:<16} {} ({})", tool.name, tool.description, params.join(", "));
    }
    println!();
}

/// Either transport binding behind one type.
enum AnyTransport {
    Http(HttpTransport),
    Stdio(StdioTransport),
}

impl fmt::Display for AnyTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(t) => t.fmt(f),
            Self::Stdio(t) => t.fmt(f),
        }
    }
}

impl Transport for AnyTransport {
    async fn connect(&mut self) -> runtime::Result<()> {
        match self {
            Self::Http(t) => t.connect().await,
            Self::Stdio(t) => t.connect().await,
        }
    }

    async fn discover(&mut self) -> runtime::Result<Vec<ToolDescriptor>> {
        match self {
            Self::Http(t) => t.discover().await,
            Self::Stdio(t) => t.discover().await,
        }
    }

    async fn send(&mut self, call: ToolCall) -> runtime::Result<PendingCall> {
        match self {
            Self::Http(t) => t.send(call).await,
            Self::Stdio(t) => t.send(call).await,
        }
    }

    async fn close(&mut self) {
        match self {
            Self::Http(t) => t.close().await,
            Self::Stdio(t) => t.close().await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Self::Http(t) => t.is_connected(),
            Self::Stdio(t) => t.is_connected(),
        }
    }
}
