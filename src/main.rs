mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use nu_ansi_term::{AnsiString, Color, Style};
use procfs::process::Process;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::time::{Duration, interval};
use tracing::info;
use vitals::config::{Config, DEFAULT_CONFIG_TEMPLATE, DEFAULT_SIGNATURES_TEMPLATE};
use vitals::detector::ProcessStats;
use vitals::models::{ArgValue, Category, SyscallEvent};
use vitals::syscalls::{CategoryClassifier, SignatureTable, SyscallTable};
use vitals::tracer::Tracer;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => init_files(cli.json)?,
        Commands::Trace {
            pid,
            sensitivity,
            show,
            hide,
        } => {
            let cfg = Config::load(cli.config.as_deref())?;
            run_trace(cfg, pid, sensitivity, show, hide, cli.json).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vitals=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn init_files(json_output: bool) -> Result<()> {
    let home = std::env::var("HOME").context("HOME is not set")?;
    let config_dir = Path::new(&home).join(".config/vitals");
    fs::create_dir_all(&config_dir)
        .with_context(|| format!("failed to create {}", config_dir.display()))?;

    let config_path = config_dir.join("config.yaml");
    let signatures_path = config_dir.join("signatures.json");
    fs::write(&config_path, DEFAULT_CONFIG_TEMPLATE)?;
    fs::write(&signatures_path, DEFAULT_SIGNATURES_TEMPLATE)?;

    if json_output {
        let value = serde_json::json!({
            "initialized": true,
            "config": config_path,
            "signatures": signatures_path,
            "timestamp": chrono::Utc::now(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Initialized vitals config at {}", config_path.display());
        println!("Wrote syscall signatures to {}", signatures_path.display());
    }

    Ok(())
}

async fn run_trace(
    cfg: Config,
    pid: i32,
    sensitivity: Option<f64>,
    show: Vec<String>,
    hide: Vec<String>,
    json_output: bool,
) -> Result<()> {
    let process = Process::new(pid).with_context(|| format!("no such process: pid {pid}"))?;
    let process_name = process
        .stat()
        .map(|stat| stat.comm)
        .unwrap_or_else(|_| "unknown".to_string());

    // A classifier without rules would silently bucket everything as
    // "other", so an empty rule set aborts here instead.
    let classifier = Arc::new(CategoryClassifier::from_rules(&cfg.categories)?);
    let syscalls = Arc::new(SyscallTable::load(&cfg.syscall_table_paths));
    let signatures = Arc::new(SignatureTable::load(Path::new(&cfg.signature_file)));

    let mut tracer = Tracer::new(pid, &cfg, syscalls, classifier, signatures);
    if let Some(level) = sensitivity {
        tracer
            .detector()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_sensitivity(level);
    }
    for name in &show {
        tracer.set_filter(&Category::new(name.clone()), true);
    }
    for name in &hide {
        tracer.set_filter(&Category::new(name.clone()), false);
    }

    tracer.start()?;
    if !json_output {
        print_startup_banner();
    }
    info!(pid, process = %process_name, "tracing; press Ctrl-C to stop");

    let queue = tracer.events();
    let mut ticker = interval(Duration::from_millis(100));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {
                for _ in 0..500 {
                    let Some(event) = queue.pop() else {
                        break;
                    };
                    if json_output {
                        println!("{}", serde_json::to_string(&event)?);
                    } else {
                        render_event(&event);
                    }
                }
            }
        }
    }

    info!("shutdown requested");
    tracer.stop();
    print_summary(&tracer, pid, &process_name, json_output)?;
    Ok(())
}

fn print_summary(tracer: &Tracer, pid: i32, process_name: &str, json_output: bool) -> Result<()> {
    let queue = tracer.events();
    let (stats, recent, recent_total) = {
        let detector = tracer.detector();
        let detector = detector.lock().unwrap_or_else(|e| e.into_inner());
        (
            detector.process_stats(pid),
            detector.recent_anomalies(5),
            detector.recent_count(),
        )
    };

    if json_output {
        let value = serde_json::json!({
            "pid": pid,
            "process": process_name,
            "stats": stats,
            "anomalies_total": recent_total,
            "events_dropped": queue.dropped(),
            "timestamp": chrono::Utc::now(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{}", "─".repeat(72));
    println!(
        "{} {} ({})",
        Style::new().bold().paint("Traced"),
        process_name,
        pid
    );
    match stats {
        Some(ProcessStats {
            uptime_secs,
            total_syscalls,
        }) => {
            println!("  observed for {uptime_secs:.1}s, {total_syscalls} syscalls analyzed");
        }
        None => println!("  no syscalls observed"),
    }
    println!(
        "  {recent_total} anomalies recorded, {} events dropped at the queue",
        queue.dropped()
    );
    for anomaly in recent {
        println!(
            "  {} {} (severity {:.2})",
            severity_marker(anomaly.severity),
            anomaly.description,
            anomaly.severity
        );
    }
    Ok(())
}

fn render_event(event: &SyscallEvent) {
    let time = event
        .timestamp
        .with_timezone(&chrono::Local)
        .format("%H:%M:%S%.3f");
    println!(
        "{time} {} {} {}",
        color_for_category(event.category.as_str()).paint(format!("[{}]", event.category)),
        Style::new().bold().paint(event.name.as_str()),
        format_event_args(&event.args)
    );
    for anomaly in &event.anomalies {
        println!(
            "        {} {} {} (severity {:.2})",
            severity_marker(anomaly.severity),
            Color::Cyan.paint(format!("[{}]", anomaly.kind)),
            anomaly.description,
            anomaly.severity
        );
    }
}

fn format_event_args(args: &BTreeMap<String, ArgValue>) -> String {
    args.iter()
        .map(|(key, value)| match value {
            ArgValue::Int(v) => format!("{key}={v}"),
            ArgValue::Float(v) => format!("{key}={v}"),
            ArgValue::Str(v) => format!("{key}={v}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn color_for_category(category: &str) -> Style {
    match category {
        "file_io" => Color::Cyan.into(),
        "fs_meta" => Color::Blue.into(),
        "process" => Color::Fixed(208).into(),
        "memory" => Color::Purple.into(),
        "ipc" => Color::LightGreen.into(),
        "network" => Color::Green.into(),
        "events" => Style::new().dimmed(),
        "time" => Color::Yellow.into(),
        "security" => Color::Red.into(),
        _ => Style::new(),
    }
}

fn severity_marker(severity: f64) -> AnsiString<'static> {
    if severity >= 0.7 {
        Color::Red.bold().paint("!!")
    } else if severity >= 0.4 {
        Color::Fixed(208).bold().paint("!?")
    } else {
        Color::Yellow.paint("??")
    }
}

fn print_startup_banner() {
    println!(
        "{}",
        Color::Cyan.bold().paint(
            r#"
       _ _        _
__   _(_) |_ __ _| |___
\ \ / / | __/ _` | / __|
 \ V /| | || (_| | \__ \
  \_/ |_|\__\__,_|_|___/
"#
        )
    );
}
