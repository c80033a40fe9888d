use clap::Parser;
use lookup_cache::feed::DirectoryChangeFeed;
use lookup_cache::query::LookupServer;
use lookup_cache::{LookupCache, LookupConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lookup-cache", about = "Local lookup cache over a directory change feed")]
struct Args {
    /// TOML 配置文件
    #[arg(long)]
    config: PathBuf,

    /// 批次文件目录（batch-<hex>.jsonl）
    #[arg(long)]
    feed_dir: PathBuf,

    /// HTTP 端口
    #[arg(long, default_value_t = 6060)]
    port: u16,

    /// 周期性输出统计的间隔（秒），0 关闭
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = LookupConfig::load(&args.config)?;
    info!(
        "Starting lookup-cache: table={} feed={:?}",
        config.table_name, args.feed_dir
    );

    let feed = DirectoryChangeFeed::new(
        args.feed_dir.clone(),
        config.layout().primary_keys().to_vec(),
        config.row_filter()?,
    );
    let cache = Arc::new(LookupCache::with_redb(config, Box::new(feed))?);

    // 首次全量是同步的，放到阻塞线程里
    {
        let cache = cache.clone();
        tokio::task::spawn_blocking(move || cache.open()).await??;
    }

    if args.stats_interval > 0 {
        let cache = cache.clone();
        let every = std::time::Duration::from_secs(args.stats_interval);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                let stats = cache.stats();
                if stats.healthy() {
                    info!("\n{}", stats);
                } else {
                    tracing::error!("\n{}", stats);
                }
            }
        });
    }

    let port = args.port;
    let server = LookupServer::new(cache.clone());
    tokio::spawn(async move {
        if let Err(e) = server.run(port).await {
            tracing::error!("HTTP lookup server stopped: {}", e);
        }
    });

    info!(
        "lookup-cache ready. Query via: http://localhost:{}/lookup?key=[1]",
        port
    );

    // 优雅退出处理
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    tokio::task::spawn_blocking(move || cache.close()).await??;

    Ok(())
}
