use clap::Parser;
use edge_feed::{DEFAULT_LISTEN_ADDR, DEFAULT_MAX_BATCH, DEFAULT_SERVER_BUFFER_CAPACITY, Exit, FeedServer, ServerConfig};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use std::{io, process};
use tracing_subscriber::filter::EnvFilter;

fn run(args: Args) -> edge_feed::FeedResult<Exit> {
    let config = ServerConfig {
        buffer_capacity: args.size,
        max_batch: args.batch,
        send_ack: !args.no_ack,
    };

    let mut server = FeedServer::bind(args.addr.as_str(), io::stdout(), config)?;
    if let Ok(addr) = server.local_addr() {
        eprintln!("Listening on {addr}");
    }
    server.interrupt_on(&[SIGINT, SIGTERM, SIGQUIT])?;
    let exit = server.serve(None)?;
    eprintln!("Served {} connections", server.finished());
    Ok(exit)
}

fn init_env_filter(env_filter: EnvFilter) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
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

    // stdout carries the received bytes, so logs go to stderr
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        init_env_filter(env_filter);
    }

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("feed-server: {e}");
        process::exit(1);
    }
}

/// Accepts feed clients and copies what they send to standard output
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The address <ip:port> to listen on
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDR)]
    addr: String,
    /// The receive buffer size
    #[arg(short, long, default_value_t = DEFAULT_SERVER_BUFFER_CAPACITY)]
    size: usize,
    /// The maximum number of readiness events handled per wait
    #[arg(short, long, default_value_t = DEFAULT_MAX_BATCH)]
    batch: usize,
    /// Do not answer finished peers with the acknowledgment token
    #[arg(long)]
    no_ack: bool,
}
