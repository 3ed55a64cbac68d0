//! CLI entry point: parse arguments, wire the cancellation channel, run
//! the engine, and render results.

use std::fs::File;
use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use log::{warn, LevelFilter};

use perfspan::cli::{parse_event_list, Args};
use perfspan::counters::catalog::EventCatalog;
use perfspan::counters::{Events, PerfOptions};
use perfspan::engine::{self, Target};
use perfspan::metrics::NamedMetrics;
use perfspan::output::{write_named, CsvSink, MetricsSink, TableSink};

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .format_timestamp(None)
        .init();

    if let Some(kind) = args.list.as_deref() {
        return list_events(kind);
    }

    let catalog = EventCatalog;
    let (base, errors) = parse_event_list(&catalog, &args.events);
    for e in errors {
        warn!("event-parse: {e}");
    }
    let mut groups = Vec::new();
    for list in &args.group_events {
        let (specs, errors) = parse_event_list(&catalog, list);
        for e in errors {
            warn!("group-parse: {e}");
        }
        if !specs.is_empty() {
            groups.push(specs);
        }
    }
    let events = Events { base, groups };
    if events.is_empty() {
        bail!("no valid events (do you have the right permissions?)");
    }

    let target = match args.pid {
        Some(pid) => Target::Pid(pid),
        None => {
            let mut command = args.command.iter();
            let Some(path) = command.next() else {
                bail!("no command given (and no --pid to attach to)");
            };
            Target::Command {
                path: path.clone(),
                args: command.cloned().collect(),
            }
        }
    };

    if args.regions.is_empty() {
        bail!("no regions given (use --region)");
    }

    let opts = PerfOptions {
        exclude_kernel: !args.kernel,
        exclude_hypervisor: !args.hypervisor,
        exclude_user: args.exclude_user,
    };

    let (cancel_tx, cancel_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = cancel_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;

    // Streaming output: render each record as it is produced, unless the
    // user asked for an aggregated summary only.
    let csv = args.csv;
    let mut stream = |record: &NamedMetrics| {
        let stdout = io::stdout();
        if csv {
            write_named(&mut CsvSink::new(stdout.lock()), record);
        } else {
            write_named(&mut TableSink::new(stdout.lock()), record);
        }
    };
    let on_record: Option<&mut dyn FnMut(&NamedMetrics)> = if args.summary {
        None
    } else {
        Some(&mut stream)
    };

    let total = engine::run(&target, &args.regions, &events, &opts, &cancel_rx, on_record)?;

    if args.summary {
        if total.is_empty() {
            warn!("no region records were collected");
        }
        let out: Box<dyn Write> = match &args.output {
            Some(path) => Box::new(
                File::create(path)
                    .with_context(|| format!("open-output: {}", path.display()))?,
            ),
            None => Box::new(io::stdout()),
        };
        let mut sink: Box<dyn MetricsSink> = if csv {
            Box::new(CsvSink::new(out))
        } else {
            Box::new(TableSink::new(out))
        };
        if args.no_sort {
            total.write_to(&mut *sink);
        } else {
            total.write_sorted(&mut *sink, &args.sort_key, args.reverse_sort);
        }
    }

    Ok(())
}

fn list_events(kind: &str) -> Result<()> {
    let catalog = EventCatalog;
    let events = match kind {
        "hardware" => catalog.available_hardware(),
        "software" => catalog.available_software(),
        "cache" => catalog.available_cache(),
        "trace" => catalog.available_tracepoints(),
        other => bail!("invalid event type '{other}', must be one of {{hardware, software, cache, trace}}"),
    };
    if events.is_empty() {
        println!("No events found, do you have the right permissions?");
    }
    for event in events {
        println!("[{kind} event]: {event}");
    }
    Ok(())
}
