use bitmap_cluster::config::ClusterConfig;
use bitmap_cluster::server::Server;
use bitmap_cluster::storage::MemoryShardStore;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {} [--config <file>] [--bind <host:port>] [--node <host:port>]... \
         [--replicas <n>] [--membership static|http|gossip] [--seed <addr:port>] \
         [--gossip-port <port>]",
        program
    );
    eprintln!("Example: {} --bind 127.0.0.1:10101", program);
    eprintln!(
        "Example: {} --bind 127.0.0.1:10102 --membership gossip --gossip-port 14001 --seed 127.0.0.1:14000",
        program
    );
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    // The config file is read first so flags can override it.
    let mut config = match args.iter().position(|a| a == "--config") {
        Some(i) => match args.get(i + 1) {
            Some(path) => ClusterConfig::load(path)?,
            None => usage(&args[0]),
        },
        None => ClusterConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--config", Some(_)) => {}
            ("--bind", Some(v)) => config.host = v.clone(),
            ("--node", Some(v)) => config.nodes.push(v.clone()),
            ("--replicas", Some(v)) => config.replicas = v.parse()?,
            ("--membership", Some(v)) => config.membership = v.clone(),
            ("--seed", Some(v)) => config.gossip.seed = Some(v.clone()),
            ("--gossip-port", Some(v)) => config.gossip.port = v.parse()?,
            ("--help", _) | (_, None) => usage(&args[0]),
            (other, _) => {
                eprintln!("Unknown flag: {}", other);
                usage(&args[0]);
            }
        }
        i += 2;
    }

    let host = config.validate()?;
    let store = Arc::new(MemoryShardStore::new(config.shard_width()?));
    let server = Arc::new(Server::new(config, store).await?);

    // 1. Internal API first: HTTP peers register with us while we join them.
    let listener = tokio::net::TcpListener::bind(&host).await?;
    tracing::info!("HTTP server listening on {}", host);
    tracing::info!("Press Ctrl+C to shutdown");

    let app = server.router();
    let http = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
    });

    // 2. Background loops and cluster join:
    server.start().await?;

    // 3. Stats reporter:
    let stats_server = server.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));

        loop {
            interval.tick().await;
            let health = stats_server.cluster().health();
            tracing::info!(
                "Cluster stats: {} node(s), replica factor {}, topology v{}",
                health.nodes.len(),
                health.replica_n,
                health.topology_version
            );
            for warning in &health.warnings {
                tracing::warn!("  - {:?}", warning);
            }
        }
    });

    http.await??;
    server.close().await;

    Ok(())
}
