use clap::{Parser, Subcommand};
use std::process;

mod commands;
mod error;
mod output;

use commands::{run, status, workers};

/// Editor Fleet - coordinate a fleet of editor instances behind one MCP endpoint
#[derive(Parser)]
#[command(name = "editor-fleet")]
#[command(author = "Editor Fleet Contributors")]
#[command(version)]
#[command(about = "Run, inspect, and manage coordinated editor instances", long_about = None)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an instance in its detected role (master, worker, or standalone)
    #[command(visible_alias = "r")]
    Run(run::RunArgs),

    /// Show the master's health and performance summary
    #[command(visible_alias = "s")]
    Status(status::StatusArgs),

    /// List the workers registered with the master
    #[command(visible_alias = "w")]
    Workers(workers::WorkersArgs),

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Handle color output
    if cli.no_color {
        colored::control::set_override(false);
    }

    // Execute command
    let result = match cli.command {
        Commands::Run(args) => run::execute(args, cli.verbose).await,
        Commands::Status(args) => status::execute(args, cli.verbose).await,
        Commands::Workers(args) => workers::execute(args, cli.verbose).await,
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    };

    // Handle errors
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        if cli.verbose {
            eprintln!("\nCaused by:");
            for cause in e.chain().skip(1) {
                eprintln!("  {}", cause);
            }
        }
        process::exit(1);
    }
}

fn generate_completions(shell: clap_complete::Shell) {
    use clap::CommandFactory;
    use clap_complete::generate;

    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
