//! Collected counter values and the accumulated per-region records.

use std::time::Duration;

use crate::output::MetricsSink;

/// One counter's label and (possibly rescaled) value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Count {
    pub label: String,
    pub value: u64,
}

/// The counters read for a single region instance, plus the wall time the
/// counters were enabled.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub counts: Vec<Count>,
    pub elapsed: Duration,
}

impl Metrics {
    /// True when the counters never ran during the region.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// A region instance's metrics tagged with the user-supplied region name.
#[derive(Debug, Clone)]
pub struct NamedMetrics {
    pub name: String,
    pub metrics: Metrics,
}

/// Every record produced by a trace, in the order the region boundaries
/// were crossed (per process; no ordering across processes).
#[derive(Debug, Clone, Default)]
pub struct TotalMetrics(pub Vec<NamedMetrics>);

const ELAPSED: &str = "time-elapsed";

impl TotalMetrics {
    pub fn push(&mut self, record: NamedMetrics) {
        self.0.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Header row: region name, the labels of the first record, elapsed.
    fn header(&self) -> Vec<String> {
        let mut header = vec![String::from("region")];
        if let Some(first) = self.0.iter().find(|r| !r.metrics.is_empty()) {
            header.extend(first.metrics.counts.iter().map(|c| c.label.clone()));
        }
        header.push(String::from(ELAPSED));
        header
    }

    fn row(record: &NamedMetrics, width: usize) -> Vec<String> {
        let mut row = vec![record.name.clone()];
        row.extend(record.metrics.counts.iter().map(|c| c.value.to_string()));
        // records with empty metrics still occupy a full row
        while row.len() < width - 1 {
            row.push(String::from("0"));
        }
        row.push(format!("{:?}", record.metrics.elapsed));
        row
    }

    /// Write all records in insertion order.
    pub fn write_to(&self, sink: &mut dyn MetricsSink) {
        let header = self.header();
        sink.set_header(&header);
        for record in &self.0 {
            sink.append(&Self::row(record, header.len()));
        }
        sink.render();
    }

    /// Write all records sorted by the named column, descending (reversed:
    /// ascending). `time-elapsed` sorts by duration; an unrecognized key
    /// falls back to the first counter column.
    pub fn write_sorted(&self, sink: &mut dyn MetricsSink, sort_key: &str, reverse: bool) {
        let header = self.header();

        let mut records: Vec<&NamedMetrics> = self.0.iter().collect();
        if sort_key == ELAPSED {
            records.sort_by_key(|r| r.metrics.elapsed);
        } else {
            let idx = records
                .iter()
                .find_map(|r| {
                    r.metrics
                        .counts
                        .iter()
                        .position(|c| c.label == sort_key)
                })
                .unwrap_or(0);
            records.sort_by_key(|r| r.metrics.counts.get(idx).map_or(0, |c| c.value));
        }
        if !reverse {
            records.reverse();
        }

        sink.set_header(&header);
        for record in records {
            sink.append(&Self::row(record, header.len()));
        }
        sink.render();
    }
}
