use std::path::PathBuf;

use clap::CommandFactory;
use clap::Parser;

/// Default fraction of total host CPU the built-in miner may consume.
pub const DEFAULT_CPU_LIMIT_FOR_BUILTIN_MINER: f64 = 0.05;

/// Built-in miner options of the `lynx-core` node.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Built-in miner options")]
pub struct Args {
    /// Disables the built-in miner.
    #[clap(long)]
    pub disable_builtin_miner: bool,

    /// CPU limit for the built-in miner.
    ///
    /// A decimal fraction of total host CPU, between 0 and 1 inclusive.
    /// 0 throttles the miner fully, 1 lets it run unthrottled.
    #[clap(
        long,
        default_value_t = DEFAULT_CPU_LIMIT_FOR_BUILTIN_MINER,
        value_name = "FRACTION"
    )]
    pub cpu_limit_for_builtin_miner: f64,

    /// Causes the built-in miner to start working immediately, without
    /// waiting for the chain synchronization to finish.
    #[clap(long)]
    pub disable_check_sync_chain: bool,

    /// Candidate reward addresses used when no wallet is available.
    ///
    /// Separated by commas, tabs or spaces. Invalid entries are logged and
    /// skipped at selection time.
    #[clap(long, value_name = "ADDRESS[,ADDRESS...]")]
    pub miner_address: Option<String>,

    /// Configuration file the miner-address list is reloaded from while the
    /// miner waits for addresses to be configured.
    #[clap(long, value_name = "PATH")]
    pub conf: Option<PathBuf>,

    /// Number of worker threads for the built-in miner.
    ///
    /// Defaults to the number of CPU cores.
    #[clap(long, value_name = "COUNT")]
    pub miner_threads: Option<usize>,
}

impl Default for Args {
    fn default() -> Self {
        let empty: Vec<String> = vec![];
        Self::parse_from(empty)
    }
}

/// Rendered help text for the miner options, for embedding into the node's
/// `--help` output.
pub fn help_string() -> String {
    Args::command().render_long_help().to_string()
}
