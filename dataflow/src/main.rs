use std::collections::HashMap;
use std::env;
use std::error::Error;

use dataflow_core::{Runtime, RuntimeConfig};
use tracing::{error, info};

mod demo;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let env_vars: HashMap<String, String> = env::vars().collect();
    let settings = demo::Settings::load(env_vars.clone())?;
    let runtime_config = RuntimeConfig::load(env_vars)?;
    info!(?settings, ?runtime_config, "Starting dataflow");

    let graph = demo::build(&settings)?;
    for operator in graph.operators() {
        info!(id = %operator.id, name = %operator.name, kind = %operator.kind, "Operator");
    }

    Runtime::new(runtime_config)
        .run(graph)
        .await
        .map_err(|e| format!("Error running dataflow graph: {e}"))?;

    match dataflow_core::metrics::encode_metrics() {
        Ok(metrics) => info!(%metrics, "Final metrics"),
        Err(e) => error!(error = ?e, "Failed to encode metrics"),
    }
    Ok(())
}
