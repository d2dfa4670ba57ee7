use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "consolidator")]
#[command(about = "Find redundant software spend and propose consolidations", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./Config.toml when present)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusFilter {
    Pending,
    Accepted,
    Dismissed,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Import products and feature assignments from a JSON inventory file
    Import { path: String },
    /// Run overlap analysis and recommendations for a company
    Analyze {
        company: String,
        /// Run as a background job and follow it through the shared progress record
        #[arg(long)]
        poll: bool,
    },
    /// Show the latest analysis progress for a company
    Progress { company: String },
    /// Request cancellation of the running analysis for a company
    Cancel { company: String },
    /// List category summaries with staleness
    Categories {
        company: String,
        /// Include the pairwise overlap results
        #[arg(long)]
        pairs: bool,
        /// Re-run the analysis first when any category is stale
        #[arg(long)]
        fresh: bool,
    },
    /// List consolidation recommendations, highest savings first
    Recommendations {
        company: String,
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
    },
    /// Mark a recommendation as accepted
    Accept { id: i64 },
    /// Mark a recommendation as dismissed
    Dismiss { id: i64 },
    /// Print configuration values
    PrintConfig,
    /// Truncate all database tables
    TruncateDb,
}
