use anyhow::{Context, Result};
use clap::Parser;
use hoverflag::bridge::{GraphqlLookup, HeaderCapture, PrivilegedActor, WindowChannel};
use hoverflag::config::Args;
use hoverflag::dom::Document;
use hoverflag::handlers;
use hoverflag::session::{Session, SessionOptions};
use hoverflag::state::AppState;
use hoverflag::storage::FileStorage;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hoverflag=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut stream) = signal(SignalKind::terminate()) {
            let _ = stream.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// this is main async function with tokio
#[tokio::main]
async fn main() -> Result<()> {
    // parse cli arguments
    let args = Args::parse();
    init_tracing(args.log_json);

    let storage = Arc::new(FileStorage::new(args.storage_path.clone()));
    let window = WindowChannel::new();
    // page mirror, fed through the /page routes by whatever renders the host page
    let doc = Document::new();

    // privileged side: replays captured page headers on profile lookups
    let actor_cancel = CancellationToken::new();
    let capture = Arc::new(HeaderCapture::new());
    let lookup = GraphqlLookup::new(reqwest::Client::new(), args.api_base.clone(), args.query_id.clone());
    let actor = PrivilegedActor::new(window.clone(), Arc::clone(&capture), Arc::new(lookup))
        .spawn(actor_cancel.clone());

    let options = SessionOptions {
        scan_delay: Duration::from_millis(args.scan_delay_ms),
        ..SessionOptions::default()
    };
    let session = Arc::new(Session::start(doc, storage, window, options).await);

    let state = Arc::new(AppState {
        session: Arc::clone(&session),
        capture,
    });
    let app = handlers::router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!("Control server on http://localhost:{}", args.port);
    info!("Storage at {}", args.storage_path.display());
    info!("Profile lookups against {}", args.api_base);
    info!("Page feed at http://localhost:{}/page", args.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control server failed")?;

    info!("Shutting down");
    session.shutdown().await;
    actor_cancel.cancel();
    let _ = actor.await;
    Ok(())
}
