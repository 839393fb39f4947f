use clap::{Parser, Subcommand};
use colored::Colorize;

mod client;
mod commands;

use client::ControlClient;

/// unbrowse - turn browsed websites into replayable API skills
#[derive(Parser)]
#[command(name = "unbrowse")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Control service base URL
    #[arg(long, env = "UNBROWSE_URL", default_value = "http://127.0.0.1:8787")]
    service: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve an intent against known skills, capturing live if needed
    Resolve {
        /// Natural-language description of what you want
        intent: String,

        /// Target page URL (enables live capture)
        #[arg(long)]
        url: Option<String>,

        /// Target domain (scopes the marketplace search)
        #[arg(long)]
        domain: Option<String>,

        /// Execute a specific endpoint of the resolved skill
        #[arg(long)]
        endpoint: Option<String>,

        /// JSON parameters for the endpoint
        #[arg(long)]
        params: Option<String>,

        /// Source path projection, e.g. data.items[]
        #[arg(long)]
        path: Option<String>,

        /// Field extraction, e.g. name:user.name,text:text
        #[arg(long)]
        extract: Option<String>,

        /// Keep only the first N rows
        #[arg(long)]
        limit: Option<usize>,

        /// Skip caches and capture fresh
        #[arg(long)]
        force_capture: bool,

        /// Allow mutating endpoints (POST/PUT/DELETE)
        #[arg(long)]
        confirm_unsafe: bool,

        /// Show what would run without executing
        #[arg(long)]
        dry_run: bool,
    },

    /// Execute a known skill by id
    Execute {
        skill_id: String,

        #[arg(long)]
        endpoint: Option<String>,

        /// JSON parameters for the endpoint
        #[arg(long)]
        params: Option<String>,

        #[arg(long)]
        confirm_unsafe: bool,

        #[arg(long)]
        path: Option<String>,

        #[arg(long)]
        extract: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Search the marketplace index
    Search {
        intent: String,

        #[arg(long)]
        domain: Option<String>,

        #[arg(short, default_value_t = 10)]
        k: usize,
    },

    /// List learned skills, or show one
    Skills {
        /// Skill id or slug to show
        id: Option<String>,
    },

    /// Open an interactive browser login and capture the session
    Login {
        url: String,

        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },

    /// Rate an endpoint execution (1-5)
    Feedback {
        skill_id: String,
        endpoint_id: String,
        rating: u8,
    },

    /// Recent capture sessions for a domain
    Sessions {
        domain: String,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = ControlClient::new(cli.service);

    let result = match cli.command {
        Commands::Resolve {
            intent,
            url,
            domain,
            endpoint,
            params,
            path,
            extract,
            limit,
            force_capture,
            confirm_unsafe,
            dry_run,
        } => {
            commands::resolve(
                &client,
                commands::ResolveArgs {
                    intent,
                    url,
                    domain,
                    endpoint,
                    params,
                    path,
                    extract,
                    limit,
                    force_capture,
                    confirm_unsafe,
                    dry_run,
                },
            )
            .await
        }
        Commands::Execute {
            skill_id,
            endpoint,
            params,
            confirm_unsafe,
            path,
            extract,
            limit,
        } => {
            commands::execute(
                &client,
                &skill_id,
                endpoint.as_deref(),
                params.as_deref(),
                confirm_unsafe,
                path,
                extract,
                limit,
            )
            .await
        }
        Commands::Search { intent, domain, k } => {
            commands::search(&client, &intent, domain.as_deref(), k).await
        }
        Commands::Skills { id } => commands::skills(&client, id.as_deref()).await,
        Commands::Login { url, timeout_secs } => {
            commands::login(&client, &url, timeout_secs).await
        }
        Commands::Feedback {
            skill_id,
            endpoint_id,
            rating,
        } => commands::feedback(&client, &skill_id, &endpoint_id, rating).await,
        Commands::Sessions { domain, limit } => {
            commands::sessions(&client, &domain, limit).await
        }
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e.message);
            std::process::exit(e.exit_code);
        }
    }
}
