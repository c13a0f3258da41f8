//! backend-header
//!
//! Hosts the backend header middleware in front of an upstream server, and
//! exposes the middleware registry on the command line.
//!
//! ```text
//!     Client Request
//!     ──────────────▶ listener ─▶ timeout/trace ─▶ [middleware chain] ─▶ upstream
//!                                                        │
//!     Client Response                                    ▼
//!     ◀────────────── X-Backend-Server: <host IPv4> ◀─ response
//! ```

use std::path::PathBuf;

use backend_header::config::LogFormat;
use backend_header::http::middleware::MiddlewareRegistry;
use backend_header::lifecycle::startup;
use backend_header::net::local_ip;
use backend_header::observability::logging;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "backend-header", version)]
#[command(about = "Stamp proxied responses with the serving host's IPv4 address", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy host
    Serve {
        #[arg(short, long, default_value = "backend-header.toml")]
        config: PathBuf,

        /// Rebuild the middleware chain when the config file changes
        #[arg(short, long)]
        watch: bool,
    },
    /// List middleware types, or show the flags of one type
    Describe { type_tag: Option<String> },
    /// Build a middleware from flags and show what it would do
    Inspect {
        type_tag: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        flags: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, watch } => {
            startup::run(&config, watch).await?;
        }
        Commands::Describe { type_tag } => {
            logging::init(LogFormat::Pretty);
            let registry = MiddlewareRegistry::with_builtins()?;
            match type_tag {
                Some(tag) => {
                    let spec = registry.lookup(&tag)?;
                    println!("{}", spec.command().render_help());
                }
                None => println!("{}", registry.describe()),
            }
        }
        Commands::Inspect { type_tag, flags } => {
            logging::init(LogFormat::Pretty);
            let registry = MiddlewareRegistry::with_builtins()?;
            let middleware = registry.lookup(&type_tag)?.parse_flags(flags)?;
            println!("{middleware}");
            println!("local address: {:?}", local_ip::local_ip());
        }
    }

    Ok(())
}
