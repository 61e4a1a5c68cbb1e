use clap::{Parser, Subcommand};
use evald_cli::{CliError, CliResult, Repl, display_text, is_continuation, read_code};
use evald_core::client::Client;
use evald_core::codec::Protocol;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon socket path
    #[arg(
        short,
        long,
        env = "EVALD_SOCKET",
        default_value = "/tmp/evald.sock",
        global = true
    )]
    socket: PathBuf,

    /// Wire protocol the daemon speaks (keyed, legacy)
    #[arg(short, long, default_value = "keyed", global = true)]
    protocol: Protocol,

    /// Context key; ignored by the legacy protocol
    #[arg(short, long, default_value = "default", global = true)]
    key: String,

    /// Per-request timeout in milliseconds, 0 for none
    #[arg(short, long, default_value = "0", global = true)]
    timeout: u32,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate one program and print its result
    Eval {
        /// Code to evaluate; read from --file or stdin when absent
        code: Option<String>,

        /// Read the program from a file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Interactive session over one connection
    Repl,
}

async fn connect(cli: &Cli) -> CliResult<Client> {
    debug!(socket = %cli.socket.display(), protocol = %cli.protocol, "connecting");
    Ok(Client::connect(&cli.socket, cli.protocol).await?)
}

async fn eval(cli: &Cli, code: Option<String>, file: Option<PathBuf>) -> CliResult<ExitCode> {
    let code = read_code(code, file.as_deref(), tokio::io::stdin()).await?;
    let mut client = connect(cli).await?;
    let response = client.eval(&cli.key, &code, cli.timeout).await?;

    if is_continuation(&response) {
        eprintln!("input is incomplete");
        return Ok(ExitCode::from(2));
    }

    let mut stdout = std::io::stdout();
    stdout.write_all(display_text(&response).as_bytes())?;
    stdout.flush()?;

    // Only the legacy protocol carries a success flag.
    if cli.protocol == Protocol::Legacy && !response.success {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn repl(cli: &Cli) -> CliResult<ExitCode> {
    let client = connect(cli).await?;
    let mut repl = Repl::new(client, cli.key.clone(), cli.timeout);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    repl.run(stdin, &mut stdout).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run(cli: Cli) -> CliResult<ExitCode> {
    match &cli.command {
        Commands::Eval { code, file } => eval(&cli, code.clone(), file.clone()).await,
        Commands::Repl => repl(&cli).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(CliError::NoCode) => {
            eprintln!("Error: no code given; pass it as an argument, with --file, or on stdin");
            ExitCode::from(64)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
