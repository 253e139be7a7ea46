//! BI Realtime Microservice

use bi_realtime::{Backends, BiConfig, BiRealtimeService};
use ehub_core::MicroserviceRuntime;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BiConfig::from_env()?;
    let _telemetry = ehub_telemetry::init(&config.service.service_name)?;

    info!(
        service = %config.service.service_name,
        redis = config.service.redis_url.is_some(),
        streams = config.consumer.streams.len(),
        "Starting BI realtime microservice"
    );

    let backends = Backends::from_config(&config).await?;
    let grace = config.shutdown_grace;
    let service = Arc::new(BiRealtimeService::new(config, backends));
    MicroserviceRuntime::new(grace).run(service).await?;

    Ok(())
}
