use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};

const DEFAULT_QUEUE_DEPTH_WARN: usize = 10_000;
const ENV_QUEUE_DEPTH_WARN: &str = "DATAFLOW_QUEUE_DEPTH_WARN";

/// Per-operator configuration. The engine only reads `name` and `flow_watermarks`; `options` is
/// passed through untouched for the operator to interpret.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Used in logs, metric labels and error messages. Defaults to the operator's type name.
    pub name: Option<String>,
    /// Forward the low watermark of all inputs to every output no watermark callback covers.
    pub flow_watermarks: bool,
    pub options: HashMap<String, String>,
}

impl OperatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_flow_watermarks(mut self, flow_watermarks: bool) -> Self {
        self.flow_watermarks = flow_watermarks;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn from_json(config: &str) -> Result<Self> {
        serde_json::from_str(config)
            .map_err(|e| Error::Config(format!("Failed to parse operator config: {e}")))
    }
}

/// Settings of the [crate::Runtime].
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Dispatch queue depth at which a reactive unit starts warning about falling behind.
    pub queue_depth_warn: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            queue_depth_warn: DEFAULT_QUEUE_DEPTH_WARN,
        }
    }
}

impl RuntimeConfig {
    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(key, _val)| key == ENV_QUEUE_DEPTH_WARN)
            .collect();

        let queue_depth_warn = match env_vars.get(ENV_QUEUE_DEPTH_WARN) {
            Some(val) => val.parse::<usize>().map_err(|e| {
                Error::Config(format!("Invalid {ENV_QUEUE_DEPTH_WARN} value {val:?}: {e}"))
            })?,
            None => DEFAULT_QUEUE_DEPTH_WARN,
        };

        if queue_depth_warn == 0 {
            return Err(Error::Config(format!(
                "{ENV_QUEUE_DEPTH_WARN} must be greater than zero"
            )));
        }

        Ok(Self { queue_depth_warn })
    }
}
