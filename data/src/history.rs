use feed::DataPoint;

use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Append {
    Accepted,
    /// The point was older than the current tail and was dropped.
    Stale,
}

/// Sliding window over the most recent readings, oldest first.
///
/// Appends never move the tail backwards in time: a point strictly earlier than
/// the current tail is dropped, which keeps the window ordered when a history
/// snapshot and the live stream race each other. Equal timestamps are accepted.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    points: VecDeque<DataPoint>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn append(&mut self, point: DataPoint) -> Append {
        if let Some(tail) = self.points.back()
            && point.timestamp < tail.timestamp
        {
            log::debug!(
                "dropping out-of-order point {} ({} < tail {})",
                point.id,
                point.timestamp,
                tail.timestamp
            );
            return Append::Stale;
        }

        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);

        Append::Accepted
    }

    /// Overwrites the buffer, keeping the last `capacity` points in the given order.
    pub fn replace_all(&mut self, points: Vec<DataPoint>) {
        let skip = points.len().saturating_sub(self.capacity);

        self.points.clear();
        self.points.extend(points.into_iter().skip(skip));
    }

    pub fn latest(&self) -> Option<&DataPoint> {
        self.points.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &DataPoint> + ExactSizeIterator {
        self.points.iter()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn to_vec(&self) -> Vec<DataPoint> {
        self.points.iter().cloned().collect()
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
pub(crate) fn point(id: i64, second: u32, value: f64) -> DataPoint {
    use chrono::NaiveDate;

    let dt = NaiveDate::from_ymd_opt(2024, 5, 1)
        .and_then(|d| d.and_hms_opt(12, second / 60, second % 60))
        .expect("valid test time");

    DataPoint {
        id,
        name: "cpu_temp".to_string(),
        value,
        timestamp: feed::Timestamp::from_naive_utc(dt),
    }
}
