use crate::history::HistoryBuffer;

use feed::{ForecastSnapshot, Timestamp};
use rustc_hash::FxHashSet;

/// Past readings followed by the forecast horizon, as parallel series.
///
/// `predicted` and `anomaly` are `None` when the overlay is hidden or no forecast
/// has been fetched yet; when present they have the same length as `labels`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedTimeline {
    pub labels: Vec<Timestamp>,
    pub actual: Vec<Option<f64>>,
    pub predicted: Option<Vec<Option<f64>>>,
    pub anomaly: Option<Vec<Option<f64>>>,
}

impl MergedTimeline {
    pub fn build(
        history: &HistoryBuffer,
        forecast: Option<&ForecastSnapshot>,
        show_forecast: bool,
    ) -> Self {
        let past_len = history.len();

        let forecast = match forecast {
            Some(snapshot) if show_forecast => snapshot,
            _ => {
                return MergedTimeline {
                    labels: history.iter().map(|p| p.timestamp).collect(),
                    actual: history.iter().map(|p| Some(p.value)).collect(),
                    predicted: None,
                    anomaly: None,
                };
            }
        };

        let horizon = forecast.predicted.len();
        let total = past_len + horizon;

        let mut labels = Vec::with_capacity(total);
        labels.extend(history.iter().map(|p| p.timestamp));
        labels.extend(forecast.predicted.iter().map(|p| p.timestamp));

        let mut actual = Vec::with_capacity(total);
        actual.extend(history.iter().map(|p| Some(p.value)));
        actual.resize(total, None);

        let mut predicted = vec![None; past_len];
        if horizon > 0
            && let (Some(slot), Some(last)) = (predicted.last_mut(), history.latest())
        {
            // join point: the forecast line starts at the last real observation
            *slot = Some(last.value);
        }
        predicted.extend(forecast.predicted.iter().map(|p| Some(p.value)));

        let flagged: FxHashSet<Timestamp> = forecast.flagged().map(|a| a.timestamp).collect();
        let mut anomaly: Vec<Option<f64>> = history
            .iter()
            .map(|p| flagged.contains(&p.timestamp).then_some(p.value))
            .collect();
        anomaly.resize(total, None);

        MergedTimeline {
            labels,
            actual,
            predicted: Some(predicted),
            anomaly: Some(anomaly),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn has_overlay(&self) -> bool {
        self.predicted.is_some()
    }

    pub fn anomaly_count(&self) -> usize {
        self.anomaly
            .as_ref()
            .map_or(0, |s| s.iter().filter(|v| v.is_some()).count())
    }
}
