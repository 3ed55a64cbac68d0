//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "perfspan",
    version,
    about = "Measure perf counters over selected regions of a traced program",
    arg_required_else_help = true
)]
pub struct Args {
    /// List available events for {hardware, software, cache, trace} event types
    #[arg(short = 'l', long, value_name = "TYPE")]
    pub list: Option<String>,

    /// Comma-separated list of events to profile
    #[arg(
        short = 'e',
        long,
        value_name = "EVENTS",
        default_value = "instructions,branch-instructions,branch-misses,cache-references,cache-misses"
    )]
    pub events: String,

    /// Comma-separated list of events to profile together as a group (repeatable)
    #[arg(short = 'g', long = "group", value_name = "EVENTS")]
    pub group_events: Vec<String>,

    /// Region(s) to profile: 'function' or 'start-end'; locations may be file:line or hex addresses
    #[arg(short = 'r', long = "region", value_name = "REGION")]
    pub regions: Vec<String>,

    /// Attach to a running process instead of spawning a command
    #[arg(short = 'p', long, value_name = "PID", conflicts_with = "command")]
    pub pid: Option<i32>,

    /// Include kernel code in measurements
    #[arg(long)]
    pub kernel: bool,

    /// Include hypervisor code in measurements
    #[arg(long)]
    pub hypervisor: bool,

    /// Exclude user code from measurements
    #[arg(long)]
    pub exclude_user: bool,

    /// Show an aggregated summary afterwards instead of printing each record immediately
    #[arg(short = 's', long)]
    pub summary: bool,

    /// Column to sort the summary table by
    #[arg(long, value_name = "KEY", default_value = "")]
    pub sort_key: String,

    /// Reverse summary table sorting
    #[arg(long)]
    pub reverse_sort: bool,

    /// Keep summary rows in event order instead of sorting
    #[arg(long)]
    pub no_sort: bool,

    /// Write output in CSV format
    #[arg(long)]
    pub csv: bool,

    /// Write summary output to a file instead of stdout
    #[arg(short = 'o', long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Show verbose debug information
    #[arg(long)]
    pub verbose: bool,

    /// Command to run and trace, with its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND [ARGS]")]
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_command_captures_target_args() {
        let args =
            Args::parse_from(["perfspan", "-r", "sum", "./target", "--flag", "value"]);
        assert_eq!(args.regions, vec!["sum"]);
        assert_eq!(args.command, vec!["./target", "--flag", "value"]);
    }

    #[test]
    fn repeatable_regions_and_groups() {
        let args = Args::parse_from([
            "perfspan",
            "-r",
            "sum",
            "-r",
            "0x1000-0x2000",
            "-g",
            "instructions,cpu-cycles",
            "./t",
        ]);
        assert_eq!(args.regions.len(), 2);
        assert_eq!(args.group_events, vec!["instructions,cpu-cycles"]);
    }

    #[test]
    fn pid_conflicts_with_command() {
        assert!(Args::try_parse_from(["perfspan", "-r", "sum", "-p", "42", "./t"]).is_err());
        let args = Args::try_parse_from(["perfspan", "-r", "sum", "-p", "42"]).unwrap();
        assert_eq!(args.pid, Some(42));
    }
}
