use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use tracing::debug;

use crate::error::{Error, Result};

// The top-level metric registry is created with the GLOBAL_PREFIX
const GLOBAL_PREFIX: &str = "dataflow";

const STREAM_LABEL: &str = "stream";
const OPERATOR_LABEL: &str = "operator";

// counters (the `_total` suffix is added by the prometheus client library)
const DATA_SENT_TOTAL: &str = "data_sent";
const WATERMARKS_SENT_TOTAL: &str = "watermarks_sent";
const DATA_CALLBACKS_TOTAL: &str = "data_callbacks";
const WATERMARK_CALLBACKS_TOTAL: &str = "watermark_callbacks";
const FATAL_ERRORS_TOTAL: &str = "operator_fatal_errors";

/// The global register of all metrics.
struct GlobalRegistry {
    // It is okay to use a blocking mutex because we register each metric only one time.
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix(GLOBAL_PREFIX)),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// EngineMetrics holds the counters updated by streams and operator units. Each metric is a family
/// differentiated by its labels, provided as `Vec<(String, String)>`.
pub(crate) struct EngineMetrics {
    pub(crate) data_sent: Family<Vec<(String, String)>, Counter>,
    pub(crate) watermarks_sent: Family<Vec<(String, String)>, Counter>,
    pub(crate) data_callbacks: Family<Vec<(String, String)>, Counter>,
    pub(crate) watermark_callbacks: Family<Vec<(String, String)>, Counter>,
    pub(crate) fatal_errors: Family<Vec<(String, String)>, Counter>,
}

impl EngineMetrics {
    fn new() -> Self {
        let metrics = Self {
            data_sent: Family::<Vec<(String, String)>, Counter>::default(),
            watermarks_sent: Family::<Vec<(String, String)>, Counter>::default(),
            data_callbacks: Family::<Vec<(String, String)>, Counter>::default(),
            watermark_callbacks: Family::<Vec<(String, String)>, Counter>::default(),
            fatal_errors: Family::<Vec<(String, String)>, Counter>::default(),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            DATA_SENT_TOTAL,
            "Total number of data messages sent on a stream",
            metrics.data_sent.clone(),
        );
        registry.register(
            WATERMARKS_SENT_TOTAL,
            "Total number of watermarks sent on a stream",
            metrics.watermarks_sent.clone(),
        );
        registry.register(
            DATA_CALLBACKS_TOTAL,
            "Total number of data callbacks invoked for an operator",
            metrics.data_callbacks.clone(),
        );
        registry.register(
            WATERMARK_CALLBACKS_TOTAL,
            "Total number of watermark callbacks fired for an operator",
            metrics.watermark_callbacks.clone(),
        );
        registry.register(
            FATAL_ERRORS_TOTAL,
            "Total number of operator units halted by a fatal error",
            metrics.fatal_errors.clone(),
        );
        metrics
    }
}

static ENGINE_METRICS: OnceLock<EngineMetrics> = OnceLock::new();

pub(crate) fn engine_metrics() -> &'static EngineMetrics {
    ENGINE_METRICS.get_or_init(EngineMetrics::new)
}

pub(crate) fn stream_labels(stream: &str) -> Vec<(String, String)> {
    vec![(STREAM_LABEL.to_string(), stream.to_string())]
}

pub(crate) fn operator_labels(operator: &str) -> Vec<(String, String)> {
    vec![(OPERATOR_LABEL.to_string(), operator.to_string())]
}

/// Renders a snapshot of every registered metric in the OpenMetrics text format.
pub fn encode_metrics() -> Result<String> {
    // make sure the engine families are registered even if nothing was sent yet
    engine_metrics();

    let registry = global_registry().registry.lock();
    let mut buffer = String::new();
    encode(&mut buffer, &registry).map_err(|e| Error::Metrics(e.to_string()))?;
    debug!("Exposing metrics: {:?}", buffer);
    Ok(buffer)
}
