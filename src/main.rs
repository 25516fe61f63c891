use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use streamfan::source::rtsp::RtspDialer;
use streamfan::{config, logging, Application};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let configuration =
        config::load(&config_path).with_context(|| format!("can't load '{config_path}'"))?;
    logging::init(&configuration.logging)?;
    info!(config = %config_path, "streamfan starting");

    let app = Application::new(configuration, Arc::new(RtspDialer::new()))?;
    app.start_streams();

    let video_addr = format!("{}:{}", app.config.video.host, app.config.video.port);
    let video_server = tokio::spawn(streamfan::server::serve(
        video_addr,
        app.video_router(),
        app.cancel.clone(),
    ));

    let api_server = if app.config.api.enabled {
        let api_addr = format!("{}:{}", app.config.api.host, app.config.api.port);
        Some(tokio::spawn(streamfan::server::serve(
            api_addr,
            app.api_router(),
            app.cancel.clone(),
        )))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    app.cancel.cancel();

    video_server.await??;
    if let Some(api) = api_server {
        api.await??;
    }
    Ok(())
}
