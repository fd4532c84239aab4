//! Verdict operator CLI.
//!
//! Talks to the server's RPC surface over a REQ socket. Most commands
//! print the response as pretty JSON; scripts can consume the output
//! directly.

mod client;
mod commands;
mod session;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use verdict_logging::LogConfig;
use verdict_protocol::defaults;

#[derive(Parser, Debug)]
#[command(name = "verdict", about = "Client for the Verdict analysis-results server")]
struct Cli {
    /// Server RPC address
    #[arg(long, global = true, env = "VERDICT_SERVER", default_value = defaults::DEFAULT_RPC_BIND_ADDR)]
    server: String,

    /// Verbose console logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Health-check the server
    Ping,
    /// Log in and persist the session locally
    Login {
        username: String,
        /// Password (or set VERDICT_PASSWORD)
        #[arg(long, env = "VERDICT_PASSWORD")]
        password: String,
    },
    /// Invalidate and forget the local session
    Logout,
    /// Show the authenticated identity
    Whoami,
    /// Server version, uptime, and task statistics
    Info,
    /// Product administration
    Products {
        #[command(subcommand)]
        command: ProductCommand,
    },
    /// Task submission and inspection
    Tasks {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Cleanup-plan triage on one product
    Plans {
        /// Product endpoint
        #[arg(long)]
        product: String,
        #[command(subcommand)]
        command: PlanCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ProductCommand {
    /// List products visible to the caller
    List,
    /// Register a product (superuser)
    Add {
        endpoint: String,
        /// Display name
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// SQLite file path for the result store
        #[arg(long, conflicts_with_all = ["pg_host", "pg_database"])]
        sqlite: Option<PathBuf>,
        /// PostgreSQL host
        #[arg(long, requires_all = ["pg_user", "pg_password", "pg_database"])]
        pg_host: Option<String>,
        #[arg(long, default_value_t = 5432)]
        pg_port: u16,
        #[arg(long)]
        pg_user: Option<String>,
        #[arg(long)]
        pg_password: Option<String>,
        #[arg(long)]
        pg_database: Option<String>,
    },
    /// Unmount and forget a product; analysis data is left untouched
    Remove { endpoint: String },
    /// Update display name or description (superuser)
    Edit {
        endpoint: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Probe a product's connection and schema status
    Status { endpoint: String },
}

#[derive(Subcommand, Debug)]
enum TaskCommand {
    /// List tasks (scope-limited to your own unless privileged)
    List {
        #[arg(long)]
        status: Vec<String>,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        product: Option<String>,
        #[arg(long)]
        actor: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Full record for one token, comments included
    Show { token: String },
    /// Request cancellation (superuser)
    Cancel { token: String },
    /// Long-poll until the task concludes
    Await {
        token: String,
        /// Mark the terminal record consumed
        #[arg(long)]
        consume: bool,
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// Append a comment
    Comment { token: String, body: String },
    /// Submit a diagnostic echo task and wait for it (superuser)
    Echo {
        #[arg(long, default_value_t = 50)]
        delay_ms: u64,
        /// Make the task fail with this message
        #[arg(long)]
        fail_with: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum PlanCommand {
    /// List open plans (--all includes closed ones)
    List {
        #[arg(long)]
        all: bool,
    },
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Due date, epoch seconds
        #[arg(long)]
        due_date: Option<i64>,
    },
    Close { id: i64 },
    Reopen { id: i64 },
    Delete { id: i64 },
    /// Associate report hashes with a plan
    Set {
        id: i64,
        hashes: Vec<String>,
    },
    /// Dissociate report hashes from a plan
    Unset {
        id: i64,
        hashes: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    verdict_logging::init_logging(LogConfig {
        app_name: "verdict",
        verbose: cli.verbose,
        quiet_console: !cli.verbose,
    })?;

    match cli.command {
        Command::Ping => commands::ping(&cli.server),
        Command::Login { username, password } => {
            commands::login(&cli.server, &username, &password)
        }
        Command::Logout => commands::logout(&cli.server),
        Command::Whoami => commands::whoami(&cli.server),
        Command::Info => commands::server_info(&cli.server),
        Command::Products { command } => commands::products(&cli.server, command),
        Command::Tasks { command } => commands::tasks(&cli.server, command),
        Command::Plans { product, command } => commands::plans(&cli.server, &product, command),
    }
}
