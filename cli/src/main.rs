mod commands;
mod config;
mod llm;
mod openfoodfacts;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::commands::{
    AnalyzeArgs, cmd_analyze, cmd_cached, cmd_corrections_add, cmd_corrections_list,
    cmd_estimates_edit, cmd_estimates_list, cmd_food_add, cmd_food_list, cmd_food_lookup,
    cmd_food_search, cmd_food_stats, cmd_food_update,
};
use crate::config::{Config, resolve_llm};
use crate::llm::HttpVisionProvider;
use crate::openfoodfacts::OpenFoodFactsClient;
use glucimiam_core::providers::ProviderKind;
use glucimiam_core::service::GluciService;

#[derive(Parser)]
#[command(
    name = "glucimiam",
    version,
    about = "Estimate the carbohydrates on your plate from a photo",
    long_about = "Estimate the carbohydrates on your plate from a photo.\n\n\
        Put a finger next to the food for scale, take one or more photos and run\n\
        `glucimiam analyze`. Correct the estimates you log and future ones will\n\
        account for it."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze meal photos and estimate their carbohydrates
    Analyze {
        /// Photos of the same meal (JPEG, PNG or WebP)
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Length of the finger visible in the photo, in millimetres
        #[arg(long)]
        finger_mm: f64,
        /// Free-text hint for the model (e.g. "cantine, portion adulte")
        #[arg(long)]
        context: Option<String>,
        /// User id, enables caching and personalization
        #[arg(long)]
        user: Option<i64>,
        /// When the meal was eaten (HH:MM or "YYYY-MM-DD HH:MM", default: now)
        #[arg(long)]
        at: Option<String>,
        /// Reuse a previous analysis of a near-identical photo
        #[arg(long)]
        reuse_cache: bool,
        /// Store the estimates so they can be corrected later (needs --user)
        #[arg(long)]
        log: bool,
        /// Vision provider: claude, openai, gemini, perplexity
        #[arg(long)]
        provider: Option<ProviderKind>,
        /// Model name (default depends on the provider)
        #[arg(long)]
        model: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Find an earlier analysis of a near-identical photo
    Cached {
        /// Photo to compare
        image: PathBuf,
        /// User id
        #[arg(long)]
        user: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage the carbohydrate reference dictionary
    Food {
        #[command(subcommand)]
        command: FoodCommands,
    },
    /// List or correct logged estimates
    Estimates {
        #[command(subcommand)]
        command: EstimatesCommands,
    },
    /// Record or list correction samples directly
    Corrections {
        #[command(subcommand)]
        command: CorrectionsCommands,
    },
    /// Start the HTTP API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication
        #[arg(long)]
        no_auth: bool,
        /// Vision provider: claude, openai, gemini, perplexity
        #[arg(long)]
        provider: Option<ProviderKind>,
        /// Model name (default depends on the provider)
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Subcommand)]
enum FoodCommands {
    /// Add a food to the dictionary
    Add {
        /// Food name
        name: String,
        /// Carbohydrates per 100g
        #[arg(long)]
        carbs: f64,
        /// Category (e.g. "féculents")
        #[arg(long)]
        category: Option<String>,
        /// Mark as a curated reference rather than a manual entry
        #[arg(long)]
        curated: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List dictionary entries
    List {
        /// Filter by name
        #[arg(short, long)]
        search: Option<String>,
        /// Maximum number of entries
        #[arg(short, long, default_value = "100")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rank dictionary entries against a food name
    Search {
        /// Food name
        query: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a reference value, asking `OpenFoodFacts` if needed
    Lookup {
        /// Food name
        query: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change a dictionary entry
    Update {
        /// Entry ID
        id: i64,
        /// New carbohydrates per 100g
        #[arg(long)]
        carbs: Option<f64>,
        /// New category
        #[arg(long, conflicts_with = "clear_category")]
        category: Option<String>,
        /// Remove the category
        #[arg(long)]
        clear_category: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Count dictionary entries by source
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum EstimatesCommands {
    /// Show a user's logged estimates, newest first
    List {
        /// User id
        #[arg(long)]
        user: i64,
        /// Maximum number of entries
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Correct a logged estimate with what was actually eaten
    Edit {
        /// Estimate ID
        id: i64,
        /// Actual weight in grams
        #[arg(long)]
        weight: Option<f64>,
        /// Actual carbohydrates in grams
        #[arg(long)]
        carbs: Option<f64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CorrectionsCommands {
    /// Record a correction sample
    Add {
        /// User id
        #[arg(long)]
        user: i64,
        /// Food name
        food: String,
        /// Corrected weight divided by the estimated weight
        #[arg(long, default_value = "1.0")]
        weight_ratio: f64,
        /// Corrected carbs divided by the estimated carbs
        #[arg(long, default_value = "1.0")]
        carbs_ratio: f64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List a user's correction samples, newest first
    List {
        /// User id
        #[arg(long)]
        user: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let serving = matches!(cli.command, Commands::Serve { .. });
    init_tracing(if serving { "info" } else { "warn" });

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let svc = GluciService::new(&config.db_path, config.analysis_settings()?)?;

    match cli.command {
        Commands::Analyze {
            images,
            finger_mm,
            context,
            user,
            at,
            reuse_cache,
            log,
            provider,
            model,
            json,
        } => {
            let llm = resolve_llm(provider, model)?;
            let vision = HttpVisionProvider::new()?;
            let off = OpenFoodFactsClient::new()?;
            let args = AnalyzeArgs {
                images,
                finger_mm,
                context,
                user,
                at,
                reuse_cache,
                log,
                json,
            };
            cmd_analyze(&svc, &vision, &off, &llm, args).await
        }
        Commands::Cached { image, user, json } => cmd_cached(&svc, &image, user, json),
        Commands::Food { command } => match command {
            FoodCommands::Add {
                name,
                carbs,
                category,
                curated,
                json,
            } => cmd_food_add(&svc, &name, carbs, category, curated, json),
            FoodCommands::List {
                search,
                limit,
                json,
            } => cmd_food_list(&svc, search.as_deref(), limit, json),
            FoodCommands::Search { query, json } => cmd_food_search(&svc, &query, json),
            FoodCommands::Lookup { query, json } => {
                let off = OpenFoodFactsClient::new()?;
                cmd_food_lookup(&svc, &off, &query, json).await
            }
            FoodCommands::Update {
                id,
                carbs,
                category,
                clear_category,
                json,
            } => cmd_food_update(&svc, id, carbs, category, clear_category, json),
            FoodCommands::Stats { json } => cmd_food_stats(&svc, json),
        },
        Commands::Estimates { command } => match command {
            EstimatesCommands::List { user, limit, json } => {
                cmd_estimates_list(&svc, user, limit, json)
            }
            EstimatesCommands::Edit {
                id,
                weight,
                carbs,
                json,
            } => cmd_estimates_edit(&svc, id, weight, carbs, json),
        },
        Commands::Corrections { command } => match command {
            CorrectionsCommands::Add {
                user,
                food,
                weight_ratio,
                carbs_ratio,
                json,
            } => cmd_corrections_add(&svc, user, &food, weight_ratio, carbs_ratio, json),
            CorrectionsCommands::List { user, json } => cmd_corrections_list(&svc, user, json),
        },
        Commands::Serve {
            port,
            bind,
            no_auth,
            provider,
            model,
        } => {
            let api_key = if no_auth {
                None
            } else {
                Some(config.load_or_create_api_key()?.0)
            };
            let llm = match resolve_llm(provider, model) {
                Ok(llm) => Some(Arc::new(llm)),
                Err(e) => {
                    eprintln!("Warning: {e:#}");
                    None
                }
            };
            let state = server::AppState {
                service: Arc::new(svc),
                provider: Arc::new(HttpVisionProvider::new()?),
                lookup: Arc::new(OpenFoodFactsClient::new()?),
                llm,
                api_key,
            };
            server::start_server(state, port, &bind).await
        }
    }
}
