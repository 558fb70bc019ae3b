use alloy::rpc::types::BlockNumberOrTag;
use clap::{Parser, Subcommand, ValueHint};
use ethereum_types::H256;
use storage_proof::proof::parse_word;
use ::storage_sync::diff::cli::CliDiffConfig;
use url::Url;

/// storage_sync config
#[derive(Parser)]
#[command(version, propagate_version = true)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,

    #[clap(flatten)]
    pub(crate) diff_config: CliDiffConfig,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Compares the full storage of two contracts and prints the differing
    /// slots as JSON.
    Diff {
        /// The source node RPC URL.
        #[arg(short = 'u', long, env = "STORAGE_SYNC_SRC_RPC_URL", value_hint = ValueHint::Url)]
        src_rpc_url: Url,
        /// The target node RPC URL. Defaults to the source node.
        #[arg(short = 't', long, env = "STORAGE_SYNC_TARGET_RPC_URL", value_hint = ValueHint::Url)]
        target_rpc_url: Option<Url>,
        /// The source contract.
        #[arg(short = 's', long)]
        src_address: String,
        /// The target contract. Defaults to the source contract.
        #[arg(short = 'a', long)]
        target_address: Option<String>,
        #[arg(long, default_value = "latest", value_parser = parse_block)]
        src_block: BlockNumberOrTag,
        #[arg(long, default_value = "latest", value_parser = parse_block)]
        target_block: BlockNumberOrTag,
    },
    /// Replays the transactions of a contract over a block range and prints
    /// the slots they wrote as JSON.
    ReplayDiff {
        /// The node RPC URL. Needs the `trace` and `parity` namespaces.
        #[arg(short = 'u', long, env = "STORAGE_SYNC_SRC_RPC_URL", value_hint = ValueHint::Url)]
        rpc_url: Url,
        #[arg(short = 's', long)]
        address: String,
        /// First block of the range (inclusive). `earliest` starts at the
        /// contract's deployment.
        #[arg(long, default_value = "earliest", value_parser = parse_block)]
        from_block: BlockNumberOrTag,
        /// Last block of the range (inclusive).
        #[arg(long, default_value = "latest", value_parser = parse_block)]
        to_block: BlockNumberOrTag,
    },
    /// Fetches, verifies and compacts the proof of a contract's account and
    /// storage slots, and prints the migration blob.
    Proof {
        /// The node RPC URL.
        #[arg(short = 'u', long, env = "STORAGE_SYNC_SRC_RPC_URL", value_hint = ValueHint::Url)]
        rpc_url: Url,
        #[arg(short = 's', long)]
        address: String,
        /// A storage slot to prove. May be repeated.
        #[arg(short = 'k', long = "key", value_parser = parse_key)]
        keys: Vec<H256>,
        /// A storage slot whose value does not change. May be repeated.
        #[arg(short = 'n', long = "unchanged-key", value_parser = parse_key)]
        unchanged_keys: Vec<H256>,
        #[arg(long, default_value = "latest", value_parser = parse_block)]
        block: BlockNumberOrTag,
        /// Only print the compacted storage proof, as submitted for
        /// incremental updates.
        #[arg(long, default_value_t = false)]
        storage_only: bool,
    },
}

/// Accepts decimal block numbers on top of what [`BlockNumberOrTag`] parses
/// (tags and `0x` quantities).
fn parse_block(s: &str) -> Result<BlockNumberOrTag, String> {
    match s.parse::<u64>() {
        Ok(number) => Ok(BlockNumberOrTag::Number(number)),
        Err(_) => s.parse().map_err(|err| format!("{err}")),
    }
}

fn parse_key(s: &str) -> Result<H256, String> {
    parse_word(s).ok_or_else(|| format!("{s:?} is not a 32 byte storage key"))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_blocks() {
        assert_eq!(parse_block("17"), Ok(BlockNumberOrTag::Number(17)));
        assert_eq!(parse_block("0x11"), Ok(BlockNumberOrTag::Number(17)));
        assert_eq!(parse_block("earliest"), Ok(BlockNumberOrTag::Earliest));
        assert_eq!(parse_block("latest"), Ok(BlockNumberOrTag::Latest));
        assert!(parse_block("yesterday").is_err());
    }

    #[test]
    fn parses_keys() {
        assert_eq!(parse_key("0x1"), Ok(H256::from_low_u64_be(1)));
        assert!(parse_key("0xzz").is_err());
    }
}
