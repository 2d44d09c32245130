use anyhow::Result;
use clap::Parser;
use serde_json::json;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Appends synthetic events to the Redis stream the notification gateway consumes.",
    long_about = None,
)]
struct Args {
    #[clap(long, env = "NOTIFY_REDIS_URL", default_value = "redis://127.0.0.1:6379/")]
    redis_url: String,

    #[clap(long, env = "NOTIFY_STREAM_KEY", default_value = "raina.events")]
    stream_key: String,

    #[clap(long, default_value = "acme")]
    tenant: String,

    /// Comma-separated workspaces; events go round-robin
    #[clap(long, value_delimiter = ',', default_value = "ws-1,ws-2,ws-3")]
    workspaces: Vec<String>,

    /// Routing key of every event
    #[clap(long, default_value = "acme.workspace.updated.v1")]
    routing_key: String,

    /// Events per second
    #[clap(short, long, default_value_t = 100)]
    rate: u64,

    /// Total events; 0 publishes until interrupted
    #[clap(short, long, default_value_t = 1000)]
    count: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    anyhow::ensure!(!args.workspaces.is_empty(), "at least one workspace is required");

    let client = redis::Client::open(args.redis_url.as_str())?;
    let mut conn = client.get_multiplexed_async_connection().await?;
    println!("Publishing to {} on {} at {} events/s", args.stream_key, args.redis_url, args.rate);

    let mut ticker = tokio::time::interval(Duration::from_micros(1_000_000 / args.rate.max(1)));
    let mut seq: u64 = 0;
    while args.count == 0 || seq < args.count {
        ticker.tick().await;
        let workspace = &args.workspaces[(seq % args.workspaces.len() as u64) as usize];
        let body = json!({
            "type": "workspace.updated",
            "tenant_id": args.tenant,
            "workspace_id": workspace,
            "seq": seq,
        });

        let _id: String = redis::cmd("XADD")
            .arg(&args.stream_key)
            .arg("*")
            .arg("routing_key")
            .arg(&args.routing_key)
            .arg("body")
            .arg(body.to_string())
            .arg("content_type")
            .arg("application/json")
            .query_async(&mut conn)
            .await?;

        seq += 1;
        if seq % 1000 == 0 {
            println!("{} events published", seq);
        }
    }

    println!("Done: {} events published", seq);
    Ok(())
}
