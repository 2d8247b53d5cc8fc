use crate::store::{HistoryFilter, SortOrder};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "grid-ingest",
    version,
    about = "Versioned grid telemetry ingest and data-quality jobs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the ingest and anomaly pipelines on their intervals until interrupted.
    Run,
    /// Run one ingest cycle and exit.
    Ingest,
    /// Run one anomaly scoring cycle and exit.
    Detect,
    /// Print raw versioned rows as JSON.
    History(HistoryArgs),
    /// Print the number of raw rows matching the filters.
    Count(CountArgs),
    /// Print the reconciled latest state as JSON.
    Latest(LatestArgs),
    /// Print day × source × metric coverage as JSON.
    Coverage(CoverageArgs),
    /// Print stored anomalies as JSON.
    Anomalies(AnomaliesArgs),
}

/// Raw-row filters shared by `history` and `count`. `end` is exclusive.
#[derive(Args, Debug)]
pub struct RowFilterArgs {
    #[arg(long)]
    pub start: Option<DateTime<Utc>>,
    #[arg(long)]
    pub end: Option<DateTime<Utc>>,
    #[arg(long)]
    pub source: Option<String>,
    #[arg(long)]
    pub metric: Option<String>,
    #[arg(long)]
    pub ukey: Option<String>,
}

impl RowFilterArgs {
    pub fn into_filter(self, limit: Option<usize>, order: SortOrder) -> HistoryFilter {
        HistoryFilter {
            start: self.start,
            end: self.end,
            source: self.source,
            metric: self.metric,
            ukey: self.ukey,
            limit,
            order,
        }
    }
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    #[command(flatten)]
    pub filter: RowFilterArgs,
    #[arg(long, default_value_t = 100)]
    pub limit: usize,
    #[arg(long, default_value = "desc")]
    pub order: SortOrder,
}

#[derive(Args, Debug)]
pub struct CountArgs {
    #[command(flatten)]
    pub filter: RowFilterArgs,
}

#[derive(Args, Debug)]
pub struct LatestArgs {
    #[arg(long)]
    pub ukey: Option<String>,
    #[arg(long)]
    pub source: Option<String>,
    #[arg(long)]
    pub metric: Option<String>,
    #[arg(long, default_value_t = 100)]
    pub limit: usize,
    #[arg(long, default_value = "desc")]
    pub order: SortOrder,
}

#[derive(Args, Debug)]
pub struct CoverageArgs {
    /// Only rows where no data landed.
    #[arg(long, default_value_t = false)]
    pub missing_only: bool,
}

#[derive(Args, Debug)]
pub struct AnomaliesArgs {
    #[arg(long)]
    pub start: Option<DateTime<Utc>>,
    #[arg(long)]
    pub end: Option<DateTime<Utc>>,
    #[arg(long)]
    pub source: Option<String>,
    #[arg(long)]
    pub metric: Option<String>,
    #[arg(long, default_value_t = 100)]
    pub limit: usize,
    #[arg(long, default_value = "desc")]
    pub order: SortOrder,
}
