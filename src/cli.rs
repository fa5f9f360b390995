use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "vitals", version, about = "Syscall vital signs for a single process.")]
pub struct Cli {
    #[arg(long, global = true, help = "Path to config YAML")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Machine-readable JSON output")]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Initialize ~/.config/vitals/ from the built-in templates")]
    Init,
    #[command(about = "Attach to a pid and stream classified syscall events")]
    Trace {
        #[arg(help = "Target process id")]
        pid: i32,

        #[arg(long, help = "Sensitivity multiplier override (clamped 0.1-3.0)")]
        sensitivity: Option<f64>,

        #[arg(long = "show", value_name = "CATEGORY", help = "Show a category hidden by default")]
        show: Vec<String>,

        #[arg(long = "hide", value_name = "CATEGORY", help = "Hide a category")]
        hide: Vec<String>,
    },
}
