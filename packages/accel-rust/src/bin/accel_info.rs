//! `accel-info`: builds a framework with the software module, applies opcode
//! overrides, and prints routing, module and configuration information as
//! JSON before tearing the framework down.

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{debug, info};

use offload_accel::{init_tracing, Accel, AccelConfig, LogConfig};

#[derive(Parser, Debug)]
#[command(name = "accel-info", version, about)]
struct Cli {
    /// Opcode override as `opcode=module`; may be repeated.
    #[arg(short, long = "assign", value_name = "OPCODE=MODULE")]
    assign: Vec<String>,

    /// Tasks pre-allocated per worker channel.
    #[arg(long, env = "ACCEL_TASK_POOL_CAPACITY", default_value_t = 2048)]
    task_pool_capacity: usize,

    /// Replace key material with a placeholder in the configuration dump.
    #[arg(long, env = "ACCEL_REDACT_KEYS")]
    redact_keys: bool,

    /// Fail key creation when encrypt and decrypt use different modules.
    #[arg(long, env = "ACCEL_STRICT_CRYPTO_ROUTING")]
    strict_crypto_routing: bool,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, env = "ACCEL_LOG", default_value = "warn")]
    log: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

fn parse_assignment(raw: &str) -> Result<(&str, &str)> {
    raw.split_once('=')
        .filter(|(op, module)| !op.is_empty() && !module.is_empty())
        .with_context(|| format!("expected OPCODE=MODULE, got {raw:?}"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&LogConfig {
        filter: cli.log.clone(),
        json: cli.log_json,
    });

    let config = AccelConfig {
        task_pool_capacity: cli.task_pool_capacity,
        redact_key_material: cli.redact_keys,
        strict_crypto_routing: cli.strict_crypto_routing,
        ..AccelConfig::default()
    };
    let accel = Accel::with_software_module(config);

    for raw in &cli.assign {
        let (opcode, module) = parse_assignment(raw)?;
        accel
            .assign_opcode_by_name(opcode, module)
            .with_context(|| format!("assigning {opcode} to {module}"))?;
    }
    accel.start().context("starting accel framework")?;
    accel.for_each_module(|m| {
        debug!(module = %m.module, opcodes = m.supported_opcodes.len(), "module registered");
    });

    let assignments: serde_json::Map<String, serde_json::Value> = accel
        .opcode_assignments()
        .into_iter()
        .map(|(op, module)| (op.name().to_string(), json!(module)))
        .collect();
    let report = json!({
        "opcode_assignments": assignments,
        "modules": accel.module_info(),
        "config": accel.write_config(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    accel.finish_async().await.context("tearing down accel framework")?;
    info!("accel-info done");
    Ok(())
}
