use clap::Parser;
use edge_feed::{AckPolicy, EngineConfig, Exit, FeedClient, DEFAULT_BUFFER_CAPACITY, DEFAULT_CONNECT_ADDR, DEFAULT_MAX_BATCH};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use std::{net::SocketAddr, path::PathBuf, process};
use tracing_subscriber::filter::EnvFilter;

fn run(args: Args) -> edge_feed::FeedResult<Exit> {
    let config = EngineConfig {
        buffer_capacity: args.size,
        max_batch: args.batch,
        ack: if args.no_ack {
            AckPolicy::NotRequired
        } else {
            AckPolicy::Required
        },
    };

    let mut client = FeedClient::connect(args.addr, &args.files, config)?;
    for path in client.skipped() {
        tracing::debug!("Could not open {}", path.display());
    }
    println!("Streaming {} files to {}", client.files().len(), args.addr);
    client.interrupt_on(&[SIGINT, SIGTERM, SIGQUIT])?;

    let exit = client.run()?;
    for outcome in client.outcomes() {
        let name = client
            .files()
            .iter()
            .find(|(handle, _)| *handle == outcome.handle)
            .map(|(_, path)| path.display().to_string())
            .unwrap_or_else(|| outcome.handle.to_string());
        println!(
            "{name}: {:?}, {} bytes sent, {} bytes received",
            outcome.reason, outcome.bytes_sent, outcome.bytes_received
        );
    }
    Ok(exit)
}

fn init_env_filter(env_filter: EnvFilter) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_level(true)
        .with_target(true);

    let subscriber = subscriber.finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() {
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to set logger: {e}");
    }

    // Initialize tracing subscriber
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    match run(args) {
        Ok(Exit::Completed) => {}
        Ok(Exit::Interrupted) => println!("Interrupted, connections released"),
        Err(e) => {
            eprintln!("feed-client: {e}");
            process::exit(1);
        }
    }
}

/// Streams local files to a feed server, one connection per file
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The files to stream. Files that cannot be opened are skipped.
    files: Vec<PathBuf>,
    /// The address <ip:port> of the server
    #[arg(short, long, default_value = DEFAULT_CONNECT_ADDR)]
    addr: SocketAddr,
    /// The per-connection buffer size
    #[arg(short, long, default_value_t = DEFAULT_BUFFER_CAPACITY)]
    size: usize,
    /// The maximum number of readiness events handled per wait
    #[arg(short, long, default_value_t = DEFAULT_MAX_BATCH)]
    batch: usize,
    /// Close each connection once its file is sent, without waiting for the server's acknowledgment
    #[arg(long)]
    no_ack: bool,
}
