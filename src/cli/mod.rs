//! Command-line surface: argument definitions and event-list parsing.

pub mod args;

pub use args::Args;

use crate::counters::catalog::{EventCatalog, EventSpec};
use crate::domain::errors::CounterError;

/// Parse a comma-separated event list against the catalog. Unknown names
/// are collected rather than aborting, so one typo does not discard the
/// rest of the list.
pub fn parse_event_list(
    catalog: &EventCatalog,
    list: &str,
) -> (Vec<EventSpec>, Vec<CounterError>) {
    let mut specs = Vec::new();
    let mut errors = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match catalog.resolve(name) {
            Ok(spec) => specs.push(spec),
            Err(e) => errors.push(e),
        }
    }
    (specs, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_events_parse_and_typos_collect() {
        let (specs, errors) =
            parse_event_list(&EventCatalog, "instructions, branch-misses,bogus");
        assert_eq!(specs.len(), 2);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], CounterError::UnknownEvent(_)));
    }

    #[test]
    fn empty_items_are_skipped() {
        let (specs, errors) = parse_event_list(&EventCatalog, "instructions,,");
        assert_eq!(specs.len(), 1);
        assert!(errors.is_empty());
    }
}
