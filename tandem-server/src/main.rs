//! Tandem server binary: env-driven config, graceful shutdown with a
//! final flush.

use tandem_server::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("failed to open storage: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("server stopped: {e}");
            }
        }
        _ = shutdown_signal() => {
            log::info!("shutdown signal received");
        }
    }

    let flushed = server.flush_all().await;
    log::info!("final flush wrote {flushed} documents");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
