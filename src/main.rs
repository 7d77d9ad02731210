use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

mod config;
mod error;
mod extractor;
mod fetcher;
mod filename;
mod locator;
mod post_url;
mod routes;
mod ytdlp;

use config::Config;
use error::AppError;
use fetcher::{BrowserHeaders, HtmlFetcher};
use locator::MediaLocator;
use routes::{AppState, build_cors_layer, build_router};
use ytdlp::{DeliveryStrategy, ToolInvocation, YtDlp, YtDlpSettings};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "media_relay=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.temp_dir).await?;

    let fetcher = HtmlFetcher::new(BrowserHeaders::default())?;
    let ytdlp = YtDlp::new(YtDlpSettings {
        invocations: vec![
            ToolInvocation::binary(config.yt_dlp_bin.clone()),
            ToolInvocation::python_module(),
        ],
        temp_dir: config.temp_dir.clone(),
        run_timeout: config.yt_dlp_timeout,
        meta_timeout: config.yt_dlp_meta_timeout,
        strategy: config.strategy,
    });

    if config.strategy == DeliveryStrategy::Direct {
        warn!("YT_DLP_STRATEGY=direct: only progressive formats, no video+audio merge");
    }
    info!(
        "yt-dlp via {:?}, temp dir {}, timeout {}s",
        config.yt_dlp_bin,
        config.temp_dir.display(),
        config.yt_dlp_timeout.as_secs()
    );

    let state = AppState {
        locator: MediaLocator::new(Arc::new(fetcher.clone())),
        fetcher,
        ytdlp: Arc::new(ytdlp),
    };

    let cors = build_cors_layer(&config.allowed_origins)?;
    let app = build_router(state, &config.public_dir, cors);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Server on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
