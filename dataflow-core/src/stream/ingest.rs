use crate::error::Result;
use crate::message::{Data, Message};
use crate::stream::{OutputStream, Stream, StreamId, WatermarkOutput, WriteStream};
use crate::timestamp::Timestamp;

/// Producer handle for a stream fed from outside the graph, e.g. by the application thread that
/// builds and runs it. Messages sent before the runtime starts are buffered and delivered once the
/// graph runs. Dropping the handle ends the stream for its consumers.
#[derive(Debug)]
pub struct IngestStream<D> {
    write_stream: WriteStream<D>,
}

impl<D: Data> IngestStream<D> {
    pub(crate) fn new(name: Option<String>) -> Self {
        let write_stream = match name {
            Some(name) => WriteStream::with_name(name),
            None => WriteStream::new(),
        };
        Self { write_stream }
    }

    pub fn id(&self) -> StreamId {
        self.write_stream.id()
    }

    pub fn name(&self) -> &str {
        self.write_stream.name()
    }

    pub fn send(&mut self, message: Message<D>) -> Result<()> {
        self.write_stream.send(message)
    }

    /// Sends `data` at `timestamp` followed by a watermark at the same timestamp.
    pub fn send_with_watermark(&mut self, timestamp: Timestamp, data: D) -> Result<()> {
        self.write_stream
            .send(Message::new_message(timestamp.clone(), data))?;
        self.write_stream.send(Message::new_watermark(timestamp))
    }

    /// Sends the terminal watermark, closing the stream.
    pub fn close(&mut self) -> Result<()> {
        self.write_stream.send(Message::new_top_watermark())
    }

    pub fn is_closed(&self) -> bool {
        self.write_stream.is_closed()
    }

    pub fn stream(&self) -> Stream {
        self.write_stream.stream()
    }
}

impl<D: Data> OutputStream for IngestStream<D> {
    fn watermark_output(&self) -> WatermarkOutput {
        self.write_stream.watermark_output()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_ingest_send_and_close() {
        let mut ingest = IngestStream::<u64>::new(Some("ingest".to_string()));
        assert_eq!(ingest.name(), "ingest");
        assert_eq!(ingest.stream().id(), ingest.id());

        ingest.send_with_watermark(Timestamp::from(1), 10).unwrap();
        let late = ingest.send(Message::new_message(Timestamp::from(1), 11));
        assert!(matches!(late, Err(Error::OrderViolation { .. })));

        ingest.close().unwrap();
        assert!(ingest.is_closed());
        assert!(matches!(
            ingest.send_with_watermark(Timestamp::from(2), 12),
            Err(Error::ClosedStream(_))
        ));
    }
}
