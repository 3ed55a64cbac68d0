//! Rendering sinks for metrics tables.

use std::io::Write;

use comfy_table::{presets, Table};
use log::warn;

use crate::metrics::NamedMetrics;

/// A destination for tabular metrics output.
pub trait MetricsSink {
    fn set_header(&mut self, headers: &[String]);
    fn append(&mut self, row: &[String]);
    /// Flush the accumulated table to the underlying writer.
    fn render(&mut self);
}

/// Pretty-printed ASCII table output.
pub struct TableSink<W: Write> {
    table: Table,
    out: W,
}

impl<W: Write> TableSink<W> {
    pub fn new(out: W) -> Self {
        let mut table = Table::new();
        table.load_preset(presets::ASCII_FULL);
        Self { table, out }
    }
}

impl<W: Write> MetricsSink for TableSink<W> {
    fn set_header(&mut self, headers: &[String]) {
        self.table.set_header(headers.to_vec());
    }

    fn append(&mut self, row: &[String]) {
        self.table.add_row(row.to_vec());
    }

    fn render(&mut self) {
        if let Err(e) = writeln!(self.out, "{}", self.table) {
            warn!("failed to render table: {e}");
        }
    }
}

/// CSV output, one record per row.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvSink<W> {
    pub fn new(out: W) -> Self {
        Self { writer: csv::Writer::from_writer(out) }
    }
}

impl<W: Write> MetricsSink for CsvSink<W> {
    fn set_header(&mut self, headers: &[String]) {
        if let Err(e) = self.writer.write_record(headers) {
            warn!("failed to write csv header: {e}");
        }
    }

    fn append(&mut self, row: &[String]) {
        if let Err(e) = self.writer.write_record(row) {
            warn!("failed to write csv row: {e}");
        }
    }

    fn render(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("failed to flush csv output: {e}");
        }
    }
}

/// Stream a single region record: one row per counter plus the elapsed
/// time, each tagged with the region name.
pub fn write_named(sink: &mut dyn MetricsSink, record: &NamedMetrics) {
    sink.set_header(&[
        String::from("region"),
        String::from("event"),
        String::from("count"),
    ]);
    for count in &record.metrics.counts {
        sink.append(&[record.name.clone(), count.label.clone(), count.value.to_string()]);
    }
    sink.append(&[
        record.name.clone(),
        String::from("time-elapsed"),
        format!("{:?}", record.metrics.elapsed),
    ]);
    sink.render();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Count, Metrics};
    use std::time::Duration;

    fn sample() -> NamedMetrics {
        NamedMetrics {
            name: "sum".into(),
            metrics: Metrics {
                counts: vec![Count { label: "instructions".into(), value: 42 }],
                elapsed: Duration::from_micros(1500),
            },
        }
    }

    #[test]
    fn csv_sink_writes_rows() {
        let mut buf = Vec::new();
        {
            let mut sink = CsvSink::new(&mut buf);
            write_named(&mut sink, &sample());
        }
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("region,event,count"));
        assert_eq!(lines.next(), Some("sum,instructions,42"));
        let elapsed = lines.next().unwrap();
        assert!(elapsed.starts_with("sum,time-elapsed,"));
    }

    #[test]
    fn table_sink_contains_cells() {
        let mut buf = Vec::new();
        {
            let mut sink = TableSink::new(&mut buf);
            write_named(&mut sink, &sample());
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("instructions"));
        assert!(text.contains("42"));
        assert!(text.contains("time-elapsed"));
    }
}
