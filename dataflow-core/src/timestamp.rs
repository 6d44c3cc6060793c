//! Timestamps are coordinate vectors ordered pointwise. Independently clocked sources can each own
//! a coordinate, so joining them needs no global clock: the partial order alone tells whether one
//! event happened at or before another.

use std::cmp::Ordering;
use std::fmt;

/// A point in the partial order of dataflow events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Timestamp {
    /// Below every other timestamp. Trackers start here.
    #[default]
    Bottom,
    /// Coordinates compared pointwise, only against vectors of the same length.
    Time(Vec<u64>),
    /// Above every other timestamp. A watermark at `Top` closes its stream.
    Top,
}

impl Timestamp {
    pub fn new(coordinates: impl Into<Vec<u64>>) -> Self {
        Timestamp::Time(coordinates.into())
    }

    pub fn bottom() -> Self {
        Timestamp::Bottom
    }

    pub fn top() -> Self {
        Timestamp::Top
    }

    pub fn is_bottom(&self) -> bool {
        matches!(self, Timestamp::Bottom)
    }

    pub fn is_top(&self) -> bool {
        matches!(self, Timestamp::Top)
    }

    /// Coordinates of a `Time`, `None` for the two sentinels.
    pub fn coordinates(&self) -> Option<&[u64]> {
        match self {
            Timestamp::Time(coordinates) => Some(coordinates),
            Timestamp::Bottom | Timestamp::Top => None,
        }
    }

    /// Greatest lower bound of two timestamps. For equal-length coordinates this is the pointwise
    /// minimum; timestamps of different lineages (coordinate lengths) have no common bound above
    /// `Bottom` and yield `None`.
    pub fn meet(&self, other: &Timestamp) -> Option<Timestamp> {
        match (self, other) {
            (Timestamp::Bottom, _) | (_, Timestamp::Bottom) => Some(Timestamp::Bottom),
            (Timestamp::Top, t) | (t, Timestamp::Top) => Some(t.clone()),
            (Timestamp::Time(a), Timestamp::Time(b)) if a.len() == b.len() => Some(
                Timestamp::Time(a.iter().zip(b.iter()).map(|(x, y)| *x.min(y)).collect()),
            ),
            (Timestamp::Time(_), Timestamp::Time(_)) => None,
        }
    }
}

impl From<u64> for Timestamp {
    fn from(coordinate: u64) -> Self {
        Timestamp::Time(vec![coordinate])
    }
}

impl From<Vec<u64>> for Timestamp {
    fn from(coordinates: Vec<u64>) -> Self {
        Timestamp::Time(coordinates)
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Timestamp::Bottom, Timestamp::Bottom) | (Timestamp::Top, Timestamp::Top) => {
                Some(Ordering::Equal)
            }
            (Timestamp::Bottom, _) | (_, Timestamp::Top) => Some(Ordering::Less),
            (_, Timestamp::Bottom) | (Timestamp::Top, _) => Some(Ordering::Greater),
            (Timestamp::Time(a), Timestamp::Time(b)) => compare_coordinates(a, b),
        }
    }
}

fn compare_coordinates(a: &[u64], b: &[u64]) -> Option<Ordering> {
    if a.len() != b.len() {
        return None;
    }

    let (mut less, mut greater) = (false, false);
    for (x, y) in a.iter().zip(b.iter()) {
        match x.cmp(y) {
            Ordering::Less => less = true,
            Ordering::Greater => greater = true,
            Ordering::Equal => {}
        }
    }

    match (less, greater) {
        (false, false) => Some(Ordering::Equal),
        (true, false) => Some(Ordering::Less),
        (false, true) => Some(Ordering::Greater),
        (true, true) => None,
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Bottom => write!(f, "bottom"),
            Timestamp::Top => write!(f, "top"),
            Timestamp::Time(coordinates) => write!(f, "{coordinates:?}"),
        }
    }
}
