//! Time-versioned operator state.
//!
//! A [TimeVersionedState] keeps, per timestamp, the data a reactive operator appended while its
//! data callbacks ran and one state value built by its watermark callbacks. What a handler may do
//! depends on where it runs:
//! - while the operator is constructed: [TimeVersionedState::set_history_size] and
//!   [TimeVersionedState::set_initial_state],
//! - in a data callback: [TimeVersionedState::append], filed under the message's timestamp,
//! - in a watermark callback: the reads, all relative to the low watermark being fired.
//!
//! Any other access is an [Error::StateAccess]. The operator hands the state to the engine with
//! [Callbacks::set_versioned_state](crate::operator::Callbacks::set_versioned_state); the engine
//! then moves the current time before each handler and garbage collects after every watermark
//! callback, keeping only the `history_size` newest states at or below the fired watermark.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::timestamp::Timestamp;

/// Where the state is being accessed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessContext {
    Construction,
    DataCallback,
    WatermarkCallback,
}

/// The hooks the engine drives on an operator's versioned state.
pub trait Versioned: Send {
    /// Moves the state to `t` before a handler runs in `context`.
    fn set_current_time(&mut self, t: &Timestamp, context: AccessContext);

    /// Releases what is no longer needed once the watermark callback at `t` has returned.
    fn close_time(&mut self, t: &Timestamp);
}

fn at_or_before(time: &Timestamp, t: &Timestamp) -> bool {
    matches!(time.partial_cmp(t), Some(Ordering::Less | Ordering::Equal))
}

pub struct TimeVersionedState<S, T> {
    current_time: Timestamp,
    history_size: usize,
    context: AccessContext,
    /// Appended data per timestamp, in first-arrival order.
    messages: Vec<(Timestamp, Vec<T>)>,
    /// States in the order their watermark first fired.
    states: Vec<(Timestamp, S)>,
}

impl<S: Default, T> Default for TimeVersionedState<S, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Default, T> TimeVersionedState<S, T> {
    /// State without history: only the state of the watermark being fired is readable.
    pub fn new() -> Self {
        Self::with_history_size(0)
    }

    pub fn with_history_size(history_size: usize) -> Self {
        Self {
            current_time: Timestamp::Bottom,
            history_size,
            context: AccessContext::Construction,
            messages: Vec::new(),
            states: Vec::new(),
        }
    }

    pub fn current_time(&self) -> &Timestamp {
        &self.current_time
    }

    pub fn history_size(&self) -> usize {
        self.history_size
    }

    fn check(&self, operation: &str, allowed: AccessContext) -> Result<()> {
        if self.context == allowed {
            return Ok(());
        }
        Err(Error::StateAccess(format!(
            "{operation} is not allowed in {:?}, only in {allowed:?}",
            self.context
        )))
    }

    /// Number of past states kept, the current one included.
    pub fn set_history_size(&mut self, history_size: usize) -> Result<()> {
        self.check("set_history_size", AccessContext::Construction)?;
        self.history_size = history_size;
        Ok(())
    }

    /// Stores the state at [Timestamp::Bottom].
    pub fn set_initial_state(&mut self, initial_state: S) -> Result<()> {
        self.check("set_initial_state", AccessContext::Construction)?;
        match self.states.iter_mut().find(|(time, _)| time.is_bottom()) {
            Some((_, state)) => *state = initial_state,
            None => self.states.insert(0, (Timestamp::Bottom, initial_state)),
        }
        Ok(())
    }

    /// Files `data` under the timestamp of the message being handled.
    pub fn append(&mut self, data: T) -> Result<()> {
        self.check("append", AccessContext::DataCallback)?;
        match self
            .messages
            .iter_mut()
            .find(|(time, _)| *time == self.current_time)
        {
            Some((_, appended)) => appended.push(data),
            None => self.messages.push((self.current_time.clone(), vec![data])),
        }
        Ok(())
    }

    /// Data appended at exactly the watermark being fired.
    pub fn get_current_messages(&self) -> Result<&[T]> {
        self.check("get_current_messages", AccessContext::WatermarkCallback)?;
        Ok(self
            .messages
            .iter()
            .find(|(time, _)| *time == self.current_time)
            .map_or(&[][..], |(_, appended)| appended.as_slice()))
    }

    /// The state at `t`, if it is still within the history of the current time.
    pub fn get_state(&self, t: &Timestamp) -> Result<Option<&S>> {
        Ok(self
            .iter_states()?
            .find(|(time, _)| *time == t)
            .map(|(_, state)| state))
    }

    pub fn get_current_state(&self) -> Result<&S> {
        self.check("get_current_state", AccessContext::WatermarkCallback)?;
        self.states
            .iter()
            .find(|(time, _)| *time == self.current_time)
            .map(|(_, state)| state)
            .ok_or_else(|| self.missing_state())
    }

    pub fn get_current_state_mut(&mut self) -> Result<&mut S> {
        self.check("get_current_state_mut", AccessContext::WatermarkCallback)?;
        let missing = self.missing_state();
        self.states
            .iter_mut()
            .find(|(time, _)| *time == self.current_time)
            .map(|(_, state)| state)
            .ok_or(missing)
    }

    fn missing_state(&self) -> Error {
        Error::StateAccess(format!("no state recorded at {}", self.current_time))
    }

    /// The states at or below the current time, newest first, at most `history_size` of them.
    pub fn iter_states(&self) -> Result<impl Iterator<Item = (&Timestamp, &S)>> {
        self.check("iter_states", AccessContext::WatermarkCallback)?;
        let current = &self.current_time;
        Ok(self
            .states
            .iter()
            .rev()
            .filter(move |(time, _)| at_or_before(time, current))
            .take(self.history_size)
            .map(|(time, state)| (time, state)))
    }
}

impl<S: Default + Send, T: Send> Versioned for TimeVersionedState<S, T> {
    fn set_current_time(&mut self, t: &Timestamp, context: AccessContext) {
        self.current_time = t.clone();
        self.context = context;
        if context == AccessContext::WatermarkCallback
            && !self.states.iter().any(|(time, _)| time == t)
        {
            self.states.push((t.clone(), S::default()));
        }
    }

    fn close_time(&mut self, t: &Timestamp) {
        self.messages.retain(|(time, _)| !at_or_before(time, t));

        let mut kept = 0;
        let mut states = std::mem::take(&mut self.states);
        states.reverse();
        states.retain(|(time, _)| {
            if !at_or_before(time, t) {
                return true;
            }
            kept += 1;
            kept <= self.history_size
        });
        states.reverse();
        self.states = states;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(coordinate: u64) -> Timestamp {
        Timestamp::from(coordinate)
    }

    #[test]
    fn test_construction_access() {
        let mut state: TimeVersionedState<u64, u64> = TimeVersionedState::with_history_size(1);
        state.set_history_size(2).unwrap();
        assert_eq!(state.history_size(), 2);
        state.set_initial_state(99).unwrap();

        assert!(matches!(state.append(3), Err(Error::StateAccess(_))));
        assert!(state.get_current_messages().is_err());
        assert!(state.get_state(&Timestamp::Bottom).is_err());
        assert!(state.get_current_state().is_err());
        assert!(state.get_current_state_mut().is_err());
        assert!(state.iter_states().is_err());
    }

    #[test]
    fn test_data_callback_appends_under_message_time() {
        let mut state: TimeVersionedState<u64, u64> = TimeVersionedState::with_history_size(1);
        state.set_current_time(&t(1), AccessContext::DataCallback);
        state.append(3).unwrap();
        state.set_current_time(&t(2), AccessContext::DataCallback);
        state.append(4).unwrap();
        state.set_current_time(&t(1), AccessContext::DataCallback);
        state.append(5).unwrap();

        assert!(state.set_history_size(2).is_err());
        assert!(state.set_initial_state(99).is_err());
        assert!(state.get_current_messages().is_err());
        assert!(state.get_current_state().is_err());

        state.set_current_time(&t(1), AccessContext::WatermarkCallback);
        assert_eq!(state.get_current_messages().unwrap(), &[3, 5]);
        state.set_current_time(&t(2), AccessContext::WatermarkCallback);
        assert_eq!(state.get_current_messages().unwrap(), &[4]);
    }

    #[test]
    fn test_watermark_callback_access() {
        let mut state: TimeVersionedState<u64, u64> = TimeVersionedState::with_history_size(1);
        state.set_current_time(&t(1), AccessContext::WatermarkCallback);

        assert!(state.set_history_size(2).is_err());
        assert!(state.append(3).is_err());
        assert_eq!(state.get_current_messages().unwrap(), &[] as &[u64]);
        assert_eq!(state.get_current_state(), Ok(&0));
        *state.get_current_state_mut().unwrap() = 7;
        assert_eq!(state.get_state(&t(1)), Ok(Some(&7)));
        assert_eq!(state.get_state(&Timestamp::Bottom), Ok(None));
        assert_eq!(state.get_state(&t(2)), Ok(None));
    }

    #[test]
    fn test_lifecycle_keeps_history_size_states() {
        let mut state: TimeVersionedState<u64, u64> = TimeVersionedState::with_history_size(2);
        state.set_initial_state(100).unwrap();

        for i in 1..=5 {
            state.set_current_time(&t(i), AccessContext::DataCallback);
            for factor in 1..=3 {
                state.append(i * factor).unwrap();
            }
        }

        for i in 1..=5 {
            state.set_current_time(&t(i), AccessContext::WatermarkCallback);
            assert_eq!(state.get_current_state(), Ok(&0));
            let sum: u64 = state.get_current_messages().unwrap().iter().sum();
            assert_eq!(sum, i * 6);
            *state.get_current_state_mut().unwrap() = sum;

            let history: Vec<(Timestamp, u64)> = state
                .iter_states()
                .unwrap()
                .map(|(time, s)| (time.clone(), *s))
                .collect();
            let previous = if i == 1 {
                (Timestamp::Bottom, 100)
            } else {
                (t(i - 1), (i - 1) * 6)
            };
            assert_eq!(history, vec![(t(i), i * 6), previous]);

            state.close_time(&t(i));
            assert!(state.messages.iter().all(|(time, _)| *time > t(i)));
            assert_eq!(state.states.len(), 2);
        }
        assert_eq!(state.messages.len(), 0);
    }

    #[test]
    fn test_without_history_close_drops_current_state() {
        let mut state: TimeVersionedState<u64, u64> = TimeVersionedState::new();
        state.set_current_time(&t(1), AccessContext::DataCallback);
        state.append(1).unwrap();
        state.set_current_time(&t(2), AccessContext::DataCallback);
        state.append(2).unwrap();

        state.set_current_time(&t(1), AccessContext::WatermarkCallback);
        assert_eq!(state.get_current_state(), Ok(&0));
        assert_eq!(state.iter_states().unwrap().count(), 0);
        state.close_time(&t(1));

        assert!(state.states.is_empty());
        assert_eq!(state.messages, vec![(t(2), vec![2])]);
    }
}
