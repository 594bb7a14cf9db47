use jobctl_infra::ControlConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobctl_observability::init();

    // Distinct from library-embedded planes sharing the same store.
    let config = ControlConfig::from_lookup(|key| {
        std::env::var(key)
            .ok()
            .or_else(|| (key == "JOBCTL_ENGINE_NAME").then(|| "jobctl-api".to_string()))
    })?;
    let plane = jobctl_api::app::services::build_plane(config).await?;

    let reconciler = plane.spawn_reconciler()?;
    let app = jobctl_api::app::build_app(plane);

    let bind = std::env::var("JOBCTL_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind).await?;

    tracing::info!("listening on {}", listener.local_addr()?);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await;
    reconciler.shutdown();
    served?;
    Ok(())
}
