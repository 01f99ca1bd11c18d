use anyhow::Result;
use clap::Parser;

use frameshift_core::config::{NodeConfig, RawConfig};
use frameshift_core::logging;
use frameshift_core::runtime::NodeRuntime;
use frameshift_server::http;

/// Self-hosted video transcoding service node.
#[derive(Debug, Parser)]
#[command(name = "frameshift", version)]
struct Args {
    /// Node role: standalone, leader, or follower.
    #[arg(long, env = "INSTANCE_TYPE")]
    instance_type: Option<String>,

    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Shared secret for inter-node request auth.
    #[arg(long, env = "SHARED_TOKEN", hide_env_values = true)]
    shared_token: Option<String>,

    /// Comma-separated follower base URLs (leader mode).
    #[arg(long, env = "FOLLOWER_URLS")]
    follower_urls: Option<String>,

    /// Leader base URL for progress callbacks (follower mode).
    #[arg(long, env = "LEADER_URL")]
    leader_url: Option<String>,

    /// Encoder thread count; must be a positive integer.
    #[arg(long, env = "FFMPEG_THREADS")]
    ffmpeg_threads: Option<String>,

    /// Media root; submitted inputs must live inside it.
    #[arg(long, env = "FRAME_SHIFT_HOME")]
    media_root: Option<String>,

    #[arg(long, env = "UPLOAD_DIR")]
    upload_dir: Option<String>,

    #[arg(long, env = "OUTPUT_DIR")]
    output_dir: Option<String>,

    /// Holds the job database and the log file.
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<String>,
}

impl Args {
    fn into_raw(self) -> RawConfig {
        RawConfig {
            instance_type: self.instance_type,
            port: self.port,
            shared_token: self.shared_token,
            follower_urls: self.follower_urls,
            leader_url: self.leader_url,
            ffmpeg_threads: self.ffmpeg_threads,
            media_root: self.media_root,
            upload_dir: self.upload_dir,
            output_dir: self.output_dir,
            data_dir: self.data_dir,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match NodeConfig::from_raw(args.into_raw()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("frameshift configuration error: {err:#}");
            std::process::exit(1);
        }
    };

    // Initialize logging as early as possible; fall back to stderr if the
    // data dir is unwritable.
    if logging::init_logging(&config.data_dir).is_err() {
        logging::init_logging_stderr();
    }

    if let Err(err) = run(config).await {
        tracing::error!("fatal: {err:#}");
        eprintln!("frameshift error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(config: NodeConfig) -> Result<()> {
    let port = config.port;
    let runtime = NodeRuntime::start(config).await?;
    let app = http::router(http::AppState::from_runtime(&runtime));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    runtime.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received");
}
