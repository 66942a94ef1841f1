use std::path::{Path, PathBuf};

use clap::Args;
use serde::Serialize;

use super::{OutputFormat, Runtime, print_json};
use crate::server::{HealthMetrics, ServerControl, ServerState};
use crate::signal::{SignalRecord, UnhealthySignal};

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Output format
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub root: PathBuf,
    pub endpoint: String,
    pub remote: bool,
    pub running: bool,
    pub state: ServerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unhealthy: Option<SignalRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthMetrics>,
}

impl StatusArgs {
    pub fn execute(&self, root: Option<&Path>) -> anyhow::Result<()> {
        let rt = Runtime::load(root)?;
        let server = rt.dolt_server();
        let running = server.is_running();

        let report = StatusReport {
            root: rt.paths.root().to_path_buf(),
            endpoint: rt.server.display_dsn(None),
            remote: rt.server.is_remote(),
            running,
            state: server.state(),
            unhealthy: UnhealthySignal::new(&rt.paths).read(),
            health: running.then(|| server.health_metrics()),
        };

        match self.format {
            OutputFormat::Json => print_json(&report),
            OutputFormat::Text => {
                print_text(&report);
                Ok(())
            }
        }
    }
}

fn print_text(report: &StatusReport) {
    println!("Root:     {}", report.root.display());
    println!(
        "Server:   {} ({})",
        report.endpoint,
        if report.remote { "remote" } else { "local" }
    );
    if report.running {
        if report.state.pid > 0 {
            println!("Status:   running (pid {})", report.state.pid);
        } else {
            println!("Status:   running");
        }
    } else {
        println!("Status:   not running");
    }

    match &report.unhealthy {
        Some(sig) => println!(
            "Signal:   UNHEALTHY ({}) since {}: {}",
            sig.reason,
            sig.timestamp.to_rfc3339(),
            sig.message
        ),
        None => println!("Signal:   healthy"),
    }

    if let Some(h) = &report.health {
        if let Some(ms) = h.latency_ms {
            println!("Latency:  {ms}ms");
        }
        if let (Some(conns), Some(pct)) = (h.connections, h.connection_pct) {
            println!("Conns:    {conns}/{} ({pct:.0}%)", h.max_connections);
        }
        if let Some(bytes) = h.disk_usage_bytes {
            let kib = u32::try_from(bytes / 1024).unwrap_or(u32::MAX);
            println!("Disk:     {:.1} MiB", f64::from(kib) / 1024.0);
        }
        if h.read_only {
            println!("Mode:     READ-ONLY");
        }
        for w in &h.warnings {
            println!("Warning:  {w}");
        }
    }

    if !report.state.databases.is_empty() {
        println!("Databases: {}", report.state.databases.join(", "));
    }
}
