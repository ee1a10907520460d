use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "fundscope",
    version,
    about = "Mutual fund disclosure retrieval, extraction and source health tooling"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Locate, retrieve and extract a single fund.
    Process(ProcessArgs),
    /// Process many funds sequentially with a delay between them.
    Batch(BatchArgs),
    /// Extract fields from a PDF on disk.
    Extract(ExtractArgs),
    /// Probe the source site for structural drift.
    Health(HealthArgs),
    /// Show cached documents and the last health report.
    Status(StatusArgs),
    /// Remove expired cache entries.
    Sweep(SweepArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ProcessArgs {
    #[arg(long, default_value = ".cache/fundscope")]
    pub cache_root: PathBuf,

    /// Fund name or registry id (with or without check digit).
    #[arg(long)]
    pub query: String,

    #[arg(long)]
    pub series: Option<String>,

    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    #[arg(long, default_value = ".cache/fundscope")]
    pub cache_root: PathBuf,

    /// One fund per line, optionally `name | series`.
    #[arg(long)]
    pub funds_file: Option<PathBuf>,

    #[arg(long = "fund")]
    pub funds: Vec<String>,

    #[arg(long, default_value_t = 2.0)]
    pub delay_secs: f64,

    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    #[arg(long, default_value = ".cache/fundscope")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub pdf: PathBuf,

    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Also write the extracted text here.
    #[arg(long)]
    pub dump_text: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct HealthArgs {
    #[arg(long, default_value = ".cache/fundscope")]
    pub cache_root: PathBuf,

    #[arg(long, default_value_t = false)]
    pub refresh_baseline: bool,

    /// Downloads smaller than this are reported as a warning.
    #[arg(long, default_value_t = 100 * 1024)]
    pub document_floor_bytes: u64,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/fundscope")]
    pub cache_root: PathBuf,

    #[arg(long, default_value_t = false)]
    pub list: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SweepArgs {
    #[arg(long, default_value = ".cache/fundscope")]
    pub cache_root: PathBuf,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn batch_collects_repeated_funds() {
        let cli = Cli::parse_from([
            "fundscope",
            "batch",
            "--fund",
            "Fondo Renta",
            "--fund",
            "8638-K",
            "--delay-secs",
            "0.5",
        ]);
        let Commands::Batch(args) = cli.command else {
            panic!("expected batch command");
        };
        assert_eq!(args.funds, vec!["Fondo Renta", "8638-K"]);
        assert_eq!(args.delay_secs, 0.5);
        assert_eq!(args.cache_root, PathBuf::from(".cache/fundscope"));
    }
}
