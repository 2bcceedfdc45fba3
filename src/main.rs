use anyhow::{Context, Result};
use librqbit::{Session, SessionOptions};
use reelstream::config::Config;
use reelstream::http::{router, AppState};
use reelstream::library::MovieLibrary;
use reelstream::pipeline::{Pipeline, WorkerLauncher};
use reelstream::session::TorrentSessionManager;
use reelstream::store::SegmentStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::from_env();
    tracing::info!(?cfg, "starting reelstream");

    std::fs::create_dir_all(cfg.movies_dir()).context("failed to create download root")?;

    let store = SegmentStore::new(cfg.movies_dir());
    let library = Arc::new(MovieLibrary::new(
        cfg.movies_dir().join("library.json"),
        store.clone(),
        cfg.evict_after_days,
    )?);
    library.recover_interrupted().await;

    let session = Session::new_with_opts(
        cfg.movies_dir(),
        SessionOptions {
            listen_port_range: Some(cfg.swarm_port_range.clone()),
            ..Default::default()
        },
    )
    .await
    .context("failed to create torrent session")?;
    let sessions = Arc::new(TorrentSessionManager::new(session, cfg.seed_reap_after));
    sessions.spawn_reaper();

    let pipeline = Arc::new(Pipeline::new(
        cfg.clone(),
        library.clone(),
        store.clone(),
        sessions,
    ));
    let launcher: Arc<dyn WorkerLauncher> = Arc::new(pipeline);

    let state = AppState {
        cfg: cfg.clone(),
        library,
        store,
        launcher,
    };

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.listen_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .await
        .context("server error")?;
    Ok(())
}
