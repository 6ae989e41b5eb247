use std::net::SocketAddr;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use udp_dispatcher::config::DispatcherConfig;
use udp_dispatcher::dispatcher::Dispatcher;
use udp_dispatcher::scheduler::AllocationAlgorithm;
use udp_dispatcher::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "udp-dispatcher")]
#[command(version)]
#[command(about = "UDP load-balancing job dispatcher with heartbeat failure detection")]
struct Args {
    /// Address to receive datagrams on
    #[arg(long, short = 'l', default_value = "127.0.0.1:50000")]
    listen: SocketAddr,

    /// Node selection strategy
    #[arg(long, short = 'a', value_enum, default_value = "weighted")]
    algorithm: AlgorithmArg,

    /// Interval between liveness probes, in milliseconds
    #[arg(long, default_value = "30000")]
    heartbeat_interval_ms: u64,

    /// Upper bound of the random delay added to a node's first probe
    #[arg(long, default_value = "250")]
    heartbeat_jitter_ms: u64,

    /// Unanswered probes tolerated before a node is evicted
    #[arg(long, default_value = "3")]
    max_warnings: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AlgorithmArg {
    RoundRobin,
    Weighted,
}

impl From<AlgorithmArg> for AllocationAlgorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::RoundRobin => AllocationAlgorithm::RoundRobin,
            AlgorithmArg::Weighted => AllocationAlgorithm::WeightedRoundRobin,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DispatcherConfig::new(args.listen, args.algorithm.into())
        .with_heartbeat_interval_ms(args.heartbeat_interval_ms)
        .with_heartbeat_jitter_ms(args.heartbeat_jitter_ms)
        .with_max_warnings(args.max_warnings);

    tracing::info!(
        listen_addr = %config.listen_addr,
        algorithm = %config.algorithm,
        max_warnings = config.max_warnings,
        "Starting udp-dispatcher"
    );

    let shutdown = install_shutdown_handler();
    let dispatcher = Dispatcher::bind(config).await?;
    dispatcher.run(shutdown).await?;

    Ok(())
}
