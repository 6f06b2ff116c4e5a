use std::sync::Arc;
use tracing::info;

mod bus;
mod chat;
mod config;
mod entity;
mod error;
mod messenger;
mod poll;
mod server;
mod store;
mod typing;

use config::DeliveryMode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file; absence is fine.
    if let Err(e) = dotenvy::dotenv() {
        info!("No .env file found or failed to load: {}", e);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Clientele daemon starting...");

    let cfg = config::Config::from_env()?;

    // CLIENTELE_DB=:memory: runs on the volatile store, handy for demos.
    let store: Arc<dyn store::Storage> = if cfg.db_path.as_os_str() == ":memory:" {
        info!("Using in-memory store");
        Arc::new(store::MemoryStore::new())
    } else {
        info!("Initializing store at {}", cfg.db_path.display());
        let sqlite = store::SqliteStore::new(&cfg.db_path).await?;
        sqlite.init().await?;
        Arc::new(sqlite)
    };

    let channels = Arc::new(bus::ChannelRegistry::new());
    let typing = typing::TypingTracker::new(channels.clone(), cfg.typing_timeout);
    let messenger = messenger::Messenger::new(
        store.clone(),
        channels.clone(),
        typing,
        cfg.delivery,
    );

    let poll_worker = match cfg.delivery {
        DeliveryMode::Poll => {
            info!("Delivery mode: poll (interval {:?})", cfg.poll_interval);
            Some(poll::PollWorker::start(
                store.clone(),
                channels.clone(),
                cfg.poll_interval,
            ))
        }
        DeliveryMode::Push => {
            info!("Delivery mode: push");
            None
        }
    };

    let app = server::router(Arc::new(server::AppState { messenger }));

    info!("Listening on {}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                info!("Server stopped with error: {}", e);
            }
        }
    }

    if let Some(worker) = poll_worker {
        worker.stop().await;
    }

    Ok(())
}
