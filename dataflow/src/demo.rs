//! The demo pipeline: two senders feeding a map that forwards the first sender's messages on its
//! watermarks, and a sink that checks every low watermark it sees against the mapped message it
//! buffered for it.
//!
//! ```text
//!   send-1 ──┐
//!            ├──> map ──┐
//!   send-2 ──┼──────────┴──> last
//!            │
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use dataflow_core::{
    Callbacks, Error, Graph, GraphBuilder, Message, Operator, OperatorConfig, OperatorKind,
    ReadStream, Result, Timestamp, TimestampedData, WriteStream, add_watermark_callback,
};
use tracing::{debug, info};

const ENV_SEND_INTERVAL_MS: &str = "DATAFLOW_SEND_INTERVAL_MS";
const ENV_CALLBACK_DELAY_MS: &str = "DATAFLOW_CALLBACK_DELAY_MS";
const ENV_MESSAGE_COUNT: &str = "DATAFLOW_MESSAGE_COUNT";

const DEFAULT_SEND_INTERVAL_MS: u64 = 100;
const DEFAULT_CALLBACK_DELAY_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Settings {
    pub(crate) send_interval: Duration,
    pub(crate) callback_delay: Duration,
    /// Messages per sender before it closes its stream. Unset, senders never stop.
    pub(crate) message_count: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            send_interval: Duration::from_millis(DEFAULT_SEND_INTERVAL_MS),
            callback_delay: Duration::from_millis(DEFAULT_CALLBACK_DELAY_MS),
            message_count: None,
        }
    }
}

impl Settings {
    pub(crate) fn load(env_vars: HashMap<String, String>) -> Result<Self> {
        let parse = |var: &str| -> Result<Option<u64>> {
            env_vars
                .get(var)
                .map(|val| {
                    val.parse::<u64>()
                        .map_err(|e| Error::Config(format!("Invalid {var} value {val:?}: {e}")))
                })
                .transpose()
        };

        let mut settings = Settings::default();
        if let Some(ms) = parse(ENV_SEND_INTERVAL_MS)? {
            settings.send_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(ENV_CALLBACK_DELAY_MS)? {
            settings.callback_delay = Duration::from_millis(ms);
        }
        settings.message_count = parse(ENV_MESSAGE_COUNT)?;
        Ok(settings)
    }
}

/// Wires the demo pipeline.
pub(crate) fn build(settings: &Settings) -> Result<Graph> {
    let mut graph = GraphBuilder::new();
    let send_args = SendArgs {
        interval: settings.send_interval,
        count: settings.message_count,
    };

    let first = graph.connect::<SendOp>(
        OperatorConfig::default().with_name("send-1"),
        &[],
        send_args.clone(),
    )?;
    let second =
        graph.connect::<SendOp>(OperatorConfig::default().with_name("send-2"), &[], send_args)?;

    let map_inputs: Vec<_> = first.iter().chain(second.iter()).cloned().collect();
    let mapped = graph.connect::<MapOp>(OperatorConfig::default().with_name("map"), &map_inputs, ())?;

    let last_inputs: Vec<_> = mapped.iter().chain(second.iter()).cloned().collect();
    graph.connect::<LastOp>(
        OperatorConfig::default().with_name("last"),
        &last_inputs,
        settings.callback_delay,
    )?;

    graph.finalize()
}

#[derive(Debug, Clone)]
struct SendArgs {
    interval: Duration,
    count: Option<u64>,
}

/// Sends an increasing counter at timestamp `[counter]`, each message followed by its watermark.
struct SendOp {
    name: String,
    output: WriteStream<u64>,
    args: SendArgs,
}

impl Operator for SendOp {
    type Inputs = ();
    type Outputs = WriteStream<u64>;
    type Args = SendArgs;

    const KIND: OperatorKind = OperatorKind::Driver;

    fn connect(_: &()) -> WriteStream<u64> {
        WriteStream::new()
    }

    fn new(
        config: OperatorConfig,
        _: (),
        output: WriteStream<u64>,
        args: SendArgs,
        _: &mut Callbacks<Self>,
    ) -> Result<Self> {
        Ok(Self {
            name: config.name.unwrap_or_default(),
            output,
            args,
        })
    }

    async fn run(mut self) -> Result<()> {
        let mut count = 0;
        while self.args.count.is_none_or(|limit| count < limit) {
            let timestamp = Timestamp::from(count);
            debug!(operator = %self.name, %timestamp, "Sending message");
            self.output
                .send(Message::new_message(timestamp.clone(), count))?;
            self.output.send(Message::new_watermark(timestamp))?;
            count += 1;
            tokio::time::sleep(self.args.interval).await;
        }
        info!(operator = %self.name, count, "Done sending, closing stream");
        self.output.send(Message::new_top_watermark())
    }
}

/// Buffers both inputs and forwards the oldest message of the first one on each of its watermarks.
struct MapOp {
    output: WriteStream<u64>,
    first: VecDeque<TimestampedData<u64>>,
    second: VecDeque<TimestampedData<u64>>,
}

impl MapOp {
    fn on_watermark(&mut self, timestamp: &Timestamp) -> Result<()> {
        if timestamp.is_top() {
            return Ok(());
        }
        info!(%timestamp, "Sending message");
        let message = self
            .first
            .pop_front()
            .ok_or_else(|| Error::Operator(format!("no message buffered for {timestamp}")))?;
        // the second input is buffered but not forwarded, keep it bounded
        while self
            .second
            .front()
            .is_some_and(|td| td.timestamp <= *timestamp)
        {
            self.second.pop_front();
        }
        self.output.send(message.into())
    }
}

impl Operator for MapOp {
    type Inputs = (ReadStream<u64>, ReadStream<u64>);
    type Outputs = WriteStream<u64>;
    type Args = ();

    fn connect(_: &(ReadStream<u64>, ReadStream<u64>)) -> WriteStream<u64> {
        WriteStream::with_name("mapped")
    }

    fn new(
        _: OperatorConfig,
        (first, second): (ReadStream<u64>, ReadStream<u64>),
        output: WriteStream<u64>,
        _: (),
        callbacks: &mut Callbacks<Self>,
    ) -> Result<Self> {
        first.add_callback(callbacks, |op: &mut MapOp, td: &TimestampedData<u64>| {
            op.first.push_back(td.clone());
            Ok(())
        })?;
        second.add_callback(callbacks, |op: &mut MapOp, td: &TimestampedData<u64>| {
            op.second.push_back(td.clone());
            Ok(())
        })?;
        add_watermark_callback(callbacks, &[&first], &[&output], MapOp::on_watermark)?;

        Ok(Self {
            output,
            first: VecDeque::new(),
            second: VecDeque::new(),
        })
    }
}

/// Watches both inputs and checks that each low watermark matches the oldest buffered message of
/// the first input. Its message callback is deliberately slow.
struct LastOp {
    delay: Duration,
    buffered: VecDeque<TimestampedData<u64>>,
}

impl LastOp {
    fn on_message(&mut self, td: &TimestampedData<u64>) -> Result<()> {
        std::thread::sleep(self.delay);
        self.buffered.push_back(td.clone());
        Ok(())
    }

    fn on_watermark(&mut self, timestamp: &Timestamp) -> Result<()> {
        if timestamp.is_top() {
            info!("Inputs closed");
            return Ok(());
        }
        let message = self
            .buffered
            .pop_front()
            .ok_or_else(|| Error::Operator(format!("no message buffered for {timestamp}")))?;
        info!(watermark = %timestamp, message = %message.timestamp, "Watermark");
        if message.timestamp != *timestamp {
            return Err(Error::Operator(format!(
                "message at {} fired at watermark {timestamp}",
                message.timestamp
            )));
        }
        Ok(())
    }
}

impl Operator for LastOp {
    type Inputs = (ReadStream<u64>, ReadStream<u64>);
    type Outputs = ();
    type Args = Duration;

    fn connect(_: &(ReadStream<u64>, ReadStream<u64>)) {}

    fn new(
        _: OperatorConfig,
        (first, second): (ReadStream<u64>, ReadStream<u64>),
        _: (),
        delay: Duration,
        callbacks: &mut Callbacks<Self>,
    ) -> Result<Self> {
        add_watermark_callback(callbacks, &[&first, &second], &[], LastOp::on_watermark)?;
        first.add_callback(callbacks, LastOp::on_message)?;
        Ok(Self {
            delay,
            buffered: VecDeque::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_core::{OperatorDescription, run};

    #[test]
    fn test_settings_load() {
        let settings = Settings::load(HashMap::new()).unwrap();
        assert_eq!(settings, Settings::default());

        let env_vars = HashMap::from([
            (ENV_SEND_INTERVAL_MS.to_string(), "5".to_string()),
            (ENV_CALLBACK_DELAY_MS.to_string(), "0".to_string()),
            (ENV_MESSAGE_COUNT.to_string(), "3".to_string()),
        ]);
        let settings = Settings::load(env_vars).unwrap();
        assert_eq!(settings.send_interval, Duration::from_millis(5));
        assert_eq!(settings.callback_delay, Duration::ZERO);
        assert_eq!(settings.message_count, Some(3));

        let env_vars = HashMap::from([(ENV_SEND_INTERVAL_MS.to_string(), "soon".to_string())]);
        assert!(matches!(Settings::load(env_vars), Err(Error::Config(_))));
    }

    #[test]
    fn test_build_wires_the_pipeline() {
        let graph = build(&Settings::default()).unwrap();
        let names: Vec<&str> = graph
            .operators()
            .map(|op: &OperatorDescription| op.name.as_str())
            .collect();
        assert_eq!(names, vec!["send-1", "send-2", "map", "last"]);
        assert_eq!(graph.streams().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bounded_demo_runs_to_completion() {
        let settings = Settings {
            send_interval: Duration::from_millis(1),
            callback_delay: Duration::from_millis(1),
            message_count: Some(20),
        };
        let graph = build(&settings).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(10), run(graph))
            .await
            .unwrap();
        assert_eq!(result, Ok(()));
    }
}
