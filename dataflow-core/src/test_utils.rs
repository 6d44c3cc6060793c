//! Operators shared by the tests of several modules.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::OperatorConfig;
use crate::error::{Error, Result};
use crate::message::{Message, TimestampedData};
use crate::operator::{Callbacks, Operator, OperatorKind, add_watermark_callback};
use crate::stream::{ReadStream, WriteStream};
use crate::timestamp::Timestamp;

pub(crate) struct SendArgs {
    pub(crate) count: u64,
    pub(crate) interval: Duration,
    /// Send the terminal watermark once `count` messages went out.
    pub(crate) close: bool,
}

/// Driver sending `t` at timestamp `[t]` followed by a watermark at `[t]`, for every `t` below
/// `count`.
pub(crate) struct SendOp {
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
        _: OperatorConfig,
        _: (),
        output: WriteStream<u64>,
        args: SendArgs,
        _: &mut Callbacks<Self>,
    ) -> Result<Self> {
        Ok(Self { output, args })
    }

    async fn run(mut self) -> Result<()> {
        for t in 0..self.args.count {
            let timestamp = Timestamp::from(t);
            self.output
                .send(Message::new_message(timestamp.clone(), t))?;
            self.output.send(Message::new_watermark(timestamp))?;
            tokio::time::sleep(self.args.interval).await;
        }
        if self.args.close {
            self.output.send(Message::new_top_watermark())?;
        }
        Ok(())
    }
}

/// Doubles every payload and forwards the input's watermarks.
pub(crate) struct MapOp {
    output: WriteStream<u64>,
}

impl Operator for MapOp {
    type Inputs = ReadStream<u64>;
    type Outputs = WriteStream<u64>;
    type Args = ();

    fn connect(_: &ReadStream<u64>) -> WriteStream<u64> {
        WriteStream::new()
    }

    fn new(
        _: OperatorConfig,
        input: ReadStream<u64>,
        output: WriteStream<u64>,
        _: (),
        callbacks: &mut Callbacks<Self>,
    ) -> Result<Self> {
        input.add_callback(callbacks, |op: &mut MapOp, td: &TimestampedData<u64>| {
            op.output
                .send(Message::new_message(td.timestamp.clone(), td.data * 2))
        })?;
        add_watermark_callback(callbacks, &[&input], &[&output], |_: &mut MapOp, _: &Timestamp| {
            Ok(())
        })?;
        Ok(Self { output })
    }
}

/// Forwards data unchanged and registers no watermark callback, watermarks only flow when the
/// operator is configured with `flow_watermarks`.
pub(crate) struct PassOp {
    output: WriteStream<u64>,
}

impl Operator for PassOp {
    type Inputs = ReadStream<u64>;
    type Outputs = WriteStream<u64>;
    type Args = ();

    fn connect(_: &ReadStream<u64>) -> WriteStream<u64> {
        WriteStream::new()
    }

    fn new(
        _: OperatorConfig,
        input: ReadStream<u64>,
        output: WriteStream<u64>,
        _: (),
        callbacks: &mut Callbacks<Self>,
    ) -> Result<Self> {
        input.add_callback(callbacks, |op: &mut PassOp, td: &TimestampedData<u64>| {
            op.output.send(td.clone().into())
        })?;
        Ok(Self { output })
    }
}

/// Buffers both inputs and, on every watermark of the first one, forwards the oldest buffered
/// message of the first input.
pub(crate) struct JoinOp {
    output: WriteStream<u64>,
    first: VecDeque<TimestampedData<u64>>,
    second: VecDeque<TimestampedData<u64>>,
}

impl Operator for JoinOp {
    type Inputs = (ReadStream<u64>, ReadStream<u64>);
    type Outputs = WriteStream<u64>;
    type Args = ();

    fn connect(_: &(ReadStream<u64>, ReadStream<u64>)) -> WriteStream<u64> {
        WriteStream::new()
    }

    fn new(
        _: OperatorConfig,
        (first, second): (ReadStream<u64>, ReadStream<u64>),
        output: WriteStream<u64>,
        _: (),
        callbacks: &mut Callbacks<Self>,
    ) -> Result<Self> {
        first.add_callback(callbacks, |op: &mut JoinOp, td: &TimestampedData<u64>| {
            op.first.push_back(td.clone());
            Ok(())
        })?;
        second.add_callback(callbacks, |op: &mut JoinOp, td: &TimestampedData<u64>| {
            op.second.push_back(td.clone());
            Ok(())
        })?;
        add_watermark_callback(
            callbacks,
            &[&first],
            &[&output],
            |op: &mut JoinOp, t: &Timestamp| {
                if t.is_top() {
                    return Ok(());
                }
                let td = op
                    .first
                    .pop_front()
                    .ok_or_else(|| Error::Operator(format!("nothing buffered at {t}")))?;
                op.output.send(td.into())
            },
        )?;
        Ok(Self {
            output,
            first: VecDeque::new(),
            second: VecDeque::new(),
        })
    }
}

pub(crate) type Records = Arc<Mutex<Vec<(Timestamp, Timestamp)>>>;

/// Watches two inputs without outputs. Buffers the first input's messages and checks on every
/// low watermark that the oldest buffered message is at exactly that timestamp, recording
/// `(message timestamp, watermark)`.
pub(crate) struct LastOp {
    buffered: VecDeque<TimestampedData<u64>>,
    records: Records,
}

impl Operator for LastOp {
    type Inputs = (ReadStream<u64>, ReadStream<u64>);
    type Outputs = ();
    type Args = Records;

    fn connect(_: &(ReadStream<u64>, ReadStream<u64>)) {}

    fn new(
        _: OperatorConfig,
        (first, second): (ReadStream<u64>, ReadStream<u64>),
        _: (),
        records: Records,
        callbacks: &mut Callbacks<Self>,
    ) -> Result<Self> {
        add_watermark_callback(
            callbacks,
            &[&first, &second],
            &[],
            |op: &mut LastOp, t: &Timestamp| {
                if t.is_top() {
                    return Ok(());
                }
                let td = op
                    .buffered
                    .pop_front()
                    .ok_or_else(|| Error::Operator(format!("nothing buffered at {t}")))?;
                op.records.lock().push((td.timestamp.clone(), t.clone()));
                if td.timestamp != *t {
                    return Err(Error::Operator(format!(
                        "buffered message at {} fired at watermark {t}",
                        td.timestamp
                    )));
                }
                Ok(())
            },
        )?;
        first.add_callback(callbacks, |op: &mut LastOp, td: &TimestampedData<u64>| {
            op.buffered.push_back(td.clone());
            Ok(())
        })?;
        Ok(Self {
            buffered: VecDeque::new(),
            records,
        })
    }
}

/// Forwards data and watermarks, and fails on the watermark at `[fail_at]`.
pub(crate) struct FailingOp {
    output: WriteStream<u64>,
}

impl Operator for FailingOp {
    type Inputs = ReadStream<u64>;
    type Outputs = WriteStream<u64>;
    type Args = u64;

    fn connect(_: &ReadStream<u64>) -> WriteStream<u64> {
        WriteStream::new()
    }

    fn new(
        _: OperatorConfig,
        input: ReadStream<u64>,
        output: WriteStream<u64>,
        fail_at: u64,
        callbacks: &mut Callbacks<Self>,
    ) -> Result<Self> {
        input.add_callback(callbacks, |op: &mut FailingOp, td: &TimestampedData<u64>| {
            op.output.send(td.clone().into())
        })?;
        let fail_at = Timestamp::from(fail_at);
        add_watermark_callback(
            callbacks,
            &[&input],
            &[&output],
            move |_: &mut FailingOp, t: &Timestamp| {
                if *t == fail_at {
                    return Err(Error::Operator(format!("failing at {t}")));
                }
                Ok(())
            },
        )?;
        Ok(Self { output })
    }
}

/// Driver whose run loop fails right away.
pub(crate) struct FailingDriver {
    _output: WriteStream<u64>,
}

impl Operator for FailingDriver {
    type Inputs = ();
    type Outputs = WriteStream<u64>;
    type Args = ();

    const KIND: OperatorKind = OperatorKind::Driver;

    fn connect(_: &()) -> WriteStream<u64> {
        WriteStream::new()
    }

    fn new(
        _: OperatorConfig,
        _: (),
        output: WriteStream<u64>,
        _: (),
        _: &mut Callbacks<Self>,
    ) -> Result<Self> {
        Ok(Self { _output: output })
    }

    async fn run(self) -> Result<()> {
        Err(Error::Operator("driver failed".to_string()))
    }
}

/// Driver that illegally registers a callback on its input.
pub(crate) struct CallbackDriver;

impl Operator for CallbackDriver {
    type Inputs = ReadStream<u64>;
    type Outputs = ();
    type Args = ();

    const KIND: OperatorKind = OperatorKind::Driver;

    fn connect(_: &ReadStream<u64>) {}

    fn new(
        _: OperatorConfig,
        input: ReadStream<u64>,
        _: (),
        _: (),
        callbacks: &mut Callbacks<Self>,
    ) -> Result<Self> {
        input.add_callback(callbacks, |_: &mut CallbackDriver, _: &TimestampedData<u64>| Ok(()))?;
        Ok(Self)
    }
}

/// Records its configured name when constructed.
pub(crate) struct RecordingOp {
    _output: WriteStream<u64>,
}

impl Operator for RecordingOp {
    type Inputs = ReadStream<u64>;
    type Outputs = WriteStream<u64>;
    type Args = Arc<Mutex<Vec<String>>>;

    fn connect(_: &ReadStream<u64>) -> WriteStream<u64> {
        WriteStream::new()
    }

    fn new(
        config: OperatorConfig,
        _: ReadStream<u64>,
        output: WriteStream<u64>,
        constructed: Arc<Mutex<Vec<String>>>,
        _: &mut Callbacks<Self>,
    ) -> Result<Self> {
        constructed
            .lock()
            .push(config.name.unwrap_or_default());
        Ok(Self { _output: output })
    }
}
