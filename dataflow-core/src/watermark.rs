//! Low watermark computation over a set of input streams.
//!
//! A watermark on a stream promises that no data at or below its timestamp will follow on that
//! stream. Across a set of inputs, the only timestamp that every input has promised is the meet
//! (greatest lower bound) of their latest watermarks, the *low watermark*. The tracker recomputes it
//! on every watermark it observes and reports it exactly when it advances past the value it last
//! reported, which is what gives a watermark callback its exactly-once-per-advance semantics.
//!
//! Timestamps of different lineages (coordinate vectors of different lengths) have no meet above
//! `Bottom`. Instead of silently picking one, the tracker rejects such a set with an
//! [Error::OrderViolation], which halts the operator owning it.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::stream::StreamId;
use crate::timestamp::Timestamp;

/// Tracks the latest watermark of each input of a watermark registration.
pub struct WatermarkTracker {
    inputs: Vec<StreamId>,
    latest: HashMap<StreamId, Timestamp>,
    last_fired: Timestamp,
}

impl WatermarkTracker {
    pub fn new(inputs: impl IntoIterator<Item = StreamId>) -> Self {
        let mut deduped: Vec<StreamId> = Vec::new();
        for input in inputs {
            if !deduped.contains(&input) {
                deduped.push(input);
            }
        }
        Self {
            inputs: deduped,
            latest: HashMap::new(),
            last_fired: Timestamp::bottom(),
        }
    }

    pub fn inputs(&self) -> &[StreamId] {
        &self.inputs
    }

    pub fn contains(&self, stream: StreamId) -> bool {
        self.inputs.contains(&stream)
    }

    /// The value of the last firing, `Bottom` if the tracker never fired.
    pub fn last_fired(&self) -> &Timestamp {
        &self.last_fired
    }

    /// Records a watermark received on `stream` and returns the new low watermark if it strictly
    /// exceeds the last fired value. Watermarks from streams outside the input set are ignored.
    pub fn observe(&mut self, stream: StreamId, watermark: &Timestamp) -> Result<Option<Timestamp>> {
        if !self.contains(stream) {
            return Ok(None);
        }
        self.latest.insert(stream, watermark.clone());

        let Some(low_watermark) = self.low_watermark()? else {
            return Ok(None);
        };

        if low_watermark.partial_cmp(&self.last_fired) == Some(std::cmp::Ordering::Greater) {
            self.last_fired = low_watermark.clone();
            Ok(Some(low_watermark))
        } else {
            Ok(None)
        }
    }

    /// Meet of the latest watermarks of all inputs; `None` while some input has not sent one.
    pub fn low_watermark(&self) -> Result<Option<Timestamp>> {
        let mut low_watermark = Timestamp::top();
        for input in &self.inputs {
            let Some(latest) = self.latest.get(input) else {
                return Ok(None);
            };
            low_watermark = low_watermark.meet(latest).ok_or_else(|| Error::OrderViolation {
                stream: input.to_string(),
                reason: format!(
                    "watermark {latest} is incomparable with the low watermark {low_watermark} of the other inputs"
                ),
            })?;
        }
        Ok(Some(low_watermark))
    }
}

impl fmt::Debug for WatermarkTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatermarkTracker")
            .field("inputs", &self.inputs)
            .field("last_fired", &self.last_fired)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_input_fires_on_every_advance() {
        let input = StreamId::next();
        let mut tracker = WatermarkTracker::new([input]);
        assert!(tracker.last_fired().is_bottom());

        for t in 0..10u64 {
            assert_eq!(
                tracker.observe(input, &Timestamp::from(t)).unwrap(),
                Some(Timestamp::from(t))
            );
        }
        assert_eq!(tracker.last_fired(), &Timestamp::from(9));
    }

    #[test]
    fn test_low_watermark_waits_for_every_input() {
        let (a, b) = (StreamId::next(), StreamId::next());
        let mut tracker = WatermarkTracker::new([a, b]);

        // b has not promised anything yet
        assert_eq!(tracker.observe(a, &Timestamp::from(3)).unwrap(), None);
        assert_eq!(tracker.low_watermark().unwrap(), None);

        assert_eq!(
            tracker.observe(b, &Timestamp::from(1)).unwrap(),
            Some(Timestamp::from(1))
        );
        // a is ahead, so advancing it further changes nothing
        assert_eq!(tracker.observe(a, &Timestamp::from(5)).unwrap(), None);
        assert_eq!(
            tracker.observe(b, &Timestamp::from(4)).unwrap(),
            Some(Timestamp::from(4))
        );
        assert_eq!(
            tracker.observe(b, &Timestamp::from(8)).unwrap(),
            Some(Timestamp::from(5))
        );
    }

    #[test]
    fn test_fires_at_most_once_per_value() {
        let (a, b) = (StreamId::next(), StreamId::next());
        let mut tracker = WatermarkTracker::new([a, b, a]);
        assert_eq!(tracker.inputs(), &[a, b]);

        tracker.observe(a, &Timestamp::from(2)).unwrap();
        assert_eq!(
            tracker.observe(b, &Timestamp::from(2)).unwrap(),
            Some(Timestamp::from(2))
        );
        assert_eq!(tracker.observe(a, &Timestamp::from(2)).unwrap(), None);
        assert_eq!(tracker.observe(b, &Timestamp::from(2)).unwrap(), None);
    }

    #[test]
    fn test_multi_coordinate_meet() {
        let (a, b) = (StreamId::next(), StreamId::next());
        let mut tracker = WatermarkTracker::new([a, b]);

        tracker.observe(a, &Timestamp::new(vec![5, 1])).unwrap();
        assert_eq!(
            tracker.observe(b, &Timestamp::new(vec![2, 3])).unwrap(),
            Some(Timestamp::new(vec![2, 1]))
        );
        assert_eq!(
            tracker.observe(a, &Timestamp::new(vec![6, 4])).unwrap(),
            Some(Timestamp::new(vec![2, 3]))
        );
    }

    #[test]
    fn test_top_on_every_input_fires_top() {
        let (a, b) = (StreamId::next(), StreamId::next());
        let mut tracker = WatermarkTracker::new([a, b]);

        tracker.observe(a, &Timestamp::top()).unwrap();
        assert_eq!(
            tracker.observe(b, &Timestamp::from(7)).unwrap(),
            Some(Timestamp::from(7))
        );
        assert_eq!(
            tracker.observe(b, &Timestamp::top()).unwrap(),
            Some(Timestamp::top())
        );
    }

    #[test]
    fn test_incomparable_lineages_are_rejected() {
        let (a, b) = (StreamId::next(), StreamId::next());
        let mut tracker = WatermarkTracker::new([a, b]);

        tracker.observe(a, &Timestamp::from(1)).unwrap();
        let result = tracker.observe(b, &Timestamp::new(vec![1, 1]));
        assert!(matches!(result, Err(Error::OrderViolation { .. })));
        assert!(tracker.last_fired().is_bottom());
    }

    #[test]
    fn test_foreign_stream_is_ignored() {
        let (a, other) = (StreamId::next(), StreamId::next());
        let mut tracker = WatermarkTracker::new([a]);
        assert_eq!(tracker.observe(other, &Timestamp::from(1)).unwrap(), None);
        assert!(!tracker.contains(other));
    }
}
