use alloy::{providers::RootProvider, transports::http::ReqwestTransport};
use anyhow::{Context as _, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use ::storage_sync::{
    diff::{parse_address, DiffConfig, DiffHandler},
    env::load_dotenvy_vars_if_present,
    migration::fetch_migration_proof,
    provider::{build_http_provider, CachedProvider},
};
use tracing::info;
use url::Url;

use self::storage_sync::*;
use crate::cli::Command;
mod storage_sync {
    pub mod cli;
}

type HttpProvider = CachedProvider<RootProvider<ReqwestTransport>, ReqwestTransport>;

fn connect(rpc_url: Url) -> HttpProvider {
    let endpoint = rpc_url.to_string();
    CachedProvider::new(build_http_provider(rpc_url), endpoint)
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenvy_vars_if_present();
    ::storage_sync::tracing::init();

    let args = cli::Cli::parse();
    let diff_config: DiffConfig = args.diff_config.into();

    match args.command {
        Command::Diff {
            src_rpc_url,
            target_rpc_url,
            src_address,
            target_address,
            src_block,
            target_block,
        } => {
            let target_rpc_url = target_rpc_url.unwrap_or_else(|| src_rpc_url.clone());
            let target_address = target_address.unwrap_or_else(|| src_address.clone());

            let handler =
                DiffHandler::new(connect(src_rpc_url), connect(target_rpc_url), diff_config);
            let diff = handler
                .diff_from_storage(&src_address, &target_address, src_block, target_block)
                .await?;

            info!("{} slots differ", diff.len());
            print_json(&diff)?;
        }
        Command::ReplayDiff {
            rpc_url,
            address,
            from_block,
            to_block,
        } => {
            // Replays only read from the source side.
            let handler = DiffHandler::new(connect(rpc_url.clone()), connect(rpc_url), diff_config);
            let diff = handler
                .diff_from_tx_replay(&address, from_block, to_block)
                .await?;

            info!("{} slots written", diff.len());
            print_json(&diff)?;
        }
        Command::Proof {
            rpc_url,
            address,
            keys,
            unchanged_keys,
            block,
            storage_only,
        } => {
            let address = parse_address(&address)?;
            let provider = connect(rpc_url);
            let proof =
                fetch_migration_proof(&provider, address, keys, &unchanged_keys, block).await?;

            let blob = if storage_only {
                proof
                    .storage_proof()
                    .cloned()
                    .context("no storage proof to submit, pass at least one --key")?
            } else {
                proof.encode()
            };

            print_json(&json!({
                "address": format!("{address:#x}"),
                "storageRoot": format!("{:#x}", proof.account().storage_root),
                "proof": format!("0x{}", hex::encode(&blob)),
            }))?;
        }
    }

    Ok(())
}
