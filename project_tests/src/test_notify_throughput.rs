use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Opens many scoped WebSocket clients against the notification gateway and reports delivery rates.",
    long_about = None,
)]
struct Args {
    /// Gateway WebSocket endpoint
    #[clap(long, default_value = "ws://127.0.0.1:8040/ws")]
    url: String,

    /// Tenant every client subscribes under
    #[clap(long, default_value = "acme")]
    tenant: String,

    /// Comma-separated workspaces; clients are spread over them
    #[clap(long, value_delimiter = ',', default_value = "ws-1,ws-2,ws-3")]
    workspaces: Vec<String>,

    /// Clients per workspace
    #[clap(short, long, default_value_t = 10)]
    clients: usize,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 60)]
    report_interval_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct Frame {
    meta: FrameMeta,
}

#[derive(Debug, Deserialize)]
struct FrameMeta {
    tenant_id: String,
    workspace_id: String,
    timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct Stats {
    global_timestamps: VecDeque<DateTime<Utc>>,
    scope_timestamps: HashMap<String, VecDeque<DateTime<Utc>>>,
    // Gateway receive time to client receive time, in milliseconds
    latencies_ms: Vec<i64>,
    misrouted: u64,
    closed: HashMap<String, u64>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let stats = Arc::new(Mutex::new(Stats::default()));

    // Clone for the reporter task
    let stats_reporter = Arc::clone(&stats);
    let report_interval_seconds = args.report_interval_seconds.max(1);
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(report_interval_seconds)).await;
            let window_start = Utc::now() - Duration::seconds(report_interval_seconds as i64);
            let mut data = stats_reporter.lock().expect("stats lock poisoned");

            while data.global_timestamps.front().is_some_and(|&t| t < window_start) {
                data.global_timestamps.pop_front();
            }
            let global = data.global_timestamps.len();

            let mut rates: Vec<(String, usize)> = Vec::new();
            for (scope, dq) in data.scope_timestamps.iter_mut() {
                while dq.front().is_some_and(|&t| t < window_start) {
                    dq.pop_front();
                }
                if !dq.is_empty() {
                    rates.push((scope.clone(), dq.len()));
                }
            }
            // Sort DESC by frames per window
            rates.sort_by(|a, b| b.1.cmp(&a.1));

            let mut latencies = std::mem::take(&mut data.latencies_ms);
            latencies.sort_unstable();
            let percentile = |p: f64| -> i64 {
                if latencies.is_empty() {
                    return 0;
                }
                let idx = ((latencies.len() - 1) as f64 * p).round() as usize;
                latencies[idx]
            };

            let report = rates
                .iter()
                .map(|(s, r)| format!("{}: {}", s, r))
                .collect::<Vec<_>>()
                .join(", ");

            println!("\n----- {}s Summary -----", report_interval_seconds);
            println!("Frames received: {}", global);
            println!("Per scope: {}", if report.is_empty() { "No data" } else { &report });
            println!(
                "Latency ms p50={} p95={} p99={}",
                percentile(0.50),
                percentile(0.95),
                percentile(0.99)
            );
            println!("Misrouted frames: {}", data.misrouted);
            if !data.closed.is_empty() {
                println!("Server closes: {:?}", data.closed);
            }
            println!("----------------------------\n");
        }
    });

    let mut sessions = Vec::new();
    for workspace in &args.workspaces {
        for n in 0..args.clients {
            let url = format!("{}?tenant_id={}&workspace_id={}", args.url, args.tenant, workspace);
            let stats = Arc::clone(&stats);
            let tenant = args.tenant.clone();
            let workspace = workspace.clone();
            sessions.push(tokio::spawn(async move {
                let (ws_stream, _) = match connect_async(url.as_str()).await {
                    Ok(connected) => connected,
                    Err(e) => {
                        eprintln!("Client {} for {}/{} failed to connect: {}", n, tenant, workspace, e);
                        return;
                    }
                };
                let (_write, mut read) = ws_stream.split();
                let expected = format!("{}/{}", tenant, workspace);

                while let Some(Ok(msg)) = read.next().await {
                    match msg {
                        Message::Text(text) => {
                            let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
                                continue;
                            };
                            let now = Utc::now();
                            let scope = format!("{}/{}", frame.meta.tenant_id, frame.meta.workspace_id);
                            let mut data = stats.lock().expect("stats lock poisoned");
                            if scope != expected {
                                data.misrouted += 1;
                            }
                            data.global_timestamps.push_back(now);
                            data.scope_timestamps.entry(scope).or_default().push_back(now);
                            data.latencies_ms.push((now - frame.meta.timestamp).num_milliseconds());
                        }
                        Message::Close(frame) => {
                            let code = frame.map(|f| u16::from(f.code).to_string()).unwrap_or_else(|| "none".into());
                            *stats.lock().expect("stats lock poisoned").closed.entry(code).or_default() += 1;
                            break;
                        }
                        _ => {}
                    }
                }
            }));
        }
    }

    println!(
        "Opened {} clients across {} workspaces. Press Ctrl+C to stop.",
        sessions.len(),
        args.workspaces.len()
    );
    let _ = tokio::signal::ctrl_c().await;
}
