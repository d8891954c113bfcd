use std::sync::Arc;

use control_http::config::Config;
use control_http::http::json::{self, JsonResponseCreatorFactory};
use control_http::http::response::StatusCode;

#[tokio::main]
async fn main() -> anyhow::Result<()>{
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;

    // Echo the submitted command back until real handlers are wired in
    let factory = JsonResponseCreatorFactory::with_handler(|request, body| {
        json::json_response(request.version, StatusCode::Ok, body)
    });

    let mut listener = cfg.listener_builder()?
        .factory(Arc::new(factory))
        .build()?;
    listener.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    listener.stop().await;

    Ok(())
}
