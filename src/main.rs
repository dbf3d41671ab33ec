//! chain-vm CLI entry point.
//!
//! Runs contracts against an in-memory ledger, mainly for trying out
//! contract builds and pool settings without a node.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chain_vm_common::abi::INIT_METHOD;
use chain_vm_common::{ConfigFile, ContractId, ContractResult};
use chain_vm_host::{InvokeRequest, MemoryLedger, Runtime, TxContext, WriteEntry};

#[derive(Parser, Debug)]
#[command(name = "chain-vm", version, about = "Pooled, gas-metered WebAssembly contract VM")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "CHAIN_VM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Invoke a contract method and print the result as JSON.
    Invoke {
        /// Path to the contract bytecode.
        #[arg(long)]
        wasm: PathBuf,

        /// Contract name.
        #[arg(long)]
        name: String,

        /// Contract version.
        #[arg(long, default_value = "1.0.0")]
        contract_version: String,

        /// Method to call.
        #[arg(long)]
        method: String,

        /// Parameter as `key=value`; may be repeated.
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Run `init_contract` before the method.
        #[arg(long)]
        init: bool,

        /// Gas already consumed by an enclosing call chain.
        #[arg(long, default_value_t = 0)]
        gas_used: u64,

        /// Number of consecutive transactions to run.
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },

    /// Compile and instantiate a contract without calling it.
    Check {
        /// Path to the contract bytecode.
        #[arg(long)]
        wasm: PathBuf,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chain_vm=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)?,
        None => ConfigFile::default(),
    };
    info!(chain_id = %config.chain_id, "Configuration loaded");

    let ledger = MemoryLedger::new();
    for entry in &config.contracts {
        let bytecode = std::fs::read(&entry.path)
            .with_context(|| format!("Failed to read contract bytecode '{}'", entry.path))?;
        ledger.deploy(ContractId::new(&entry.name, &entry.version), bytecode);
    }

    let runtime = Runtime::new(config.chain_id.clone(), config.runtime.clone())?;

    match cli.command {
        Command::Invoke {
            wasm,
            name,
            contract_version,
            method,
            params,
            init,
            gas_used,
            repeat,
        } => {
            let bytecode: Arc<[u8]> = std::fs::read(&wasm)
                .with_context(|| format!("Failed to read '{}'", wasm.display()))?
                .into();
            let contract = ContractId::new(name, contract_version);
            ledger.deploy(contract.clone(), Arc::clone(&bytecode));

            if init {
                let tx = ledger.begin("tx-init");
                let request =
                    InvokeRequest::new(contract.clone(), Arc::clone(&bytecode), INIT_METHOD, tx.clone());
                let result = runtime.invoke(request).await?;
                if !result.is_success() {
                    anyhow::bail!("init_contract failed: {}", result.message);
                }
                tx.commit();
            }

            for round in 0..repeat {
                let tx = ledger.begin(format!("tx-{round}"));
                let mut request =
                    InvokeRequest::new(contract.clone(), Arc::clone(&bytecode), &method, tx.clone());
                request.gas_used = gas_used;
                for (key, value) in &params {
                    request = request.with_param(key, value.as_bytes());
                }

                let result = runtime.invoke(request).await?;
                if result.is_success() {
                    tx.commit();
                }

                println!(
                    "{}",
                    serde_json::to_string_pretty(&report(&result, &tx.write_set()))?
                );
            }
        }
        Command::Check { wasm } => {
            let bytecode = std::fs::read(&wasm)
                .with_context(|| format!("Failed to read '{}'", wasm.display()))?;
            let contract = ContractId::new("check", "0");
            let pool = runtime
                .manager()
                .get_or_create_pool(&contract, &bytecode)
                .await?;
            let module = pool.module();
            let missing = module.missing_exports();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "ok": missing.is_empty(),
                    "code_hash": module.code_hash(),
                    "methods": module.methods(),
                    "missing_exports": missing,
                    "instances_ready": pool.ready_count(),
                }))?
            );
        }
    }

    runtime.shutdown().await;
    Ok(())
}

fn report(result: &ContractResult, writes: &[WriteEntry]) -> serde_json::Value {
    json!({
        "code": result.code,
        "result": String::from_utf8_lossy(&result.result),
        "message": result.message,
        "gas_used": result.gas_used,
        "special_tx_type": result.special_tx_type,
        "events": result.events,
        "write_set": writes
            .iter()
            .map(|w| json!({
                "contract": w.contract,
                "key": String::from_utf8_lossy(&w.key),
                "value": w.value,
            }))
            .collect::<Vec<_>>(),
    })
}
