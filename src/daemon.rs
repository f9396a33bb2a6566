use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::BackendClient;
use crate::config::Config;
use crate::panel::render_history;
use crate::reconcile::{HistoryStore, Reconciler, RefreshTrigger, reconcile_loop};

/// Reconcile history until a shutdown signal, printing each new snapshot.
pub async fn run(config: Config, client: BackendClient) -> Result<()> {
    let store = Arc::new(HistoryStore::new());
    let reconciler = Arc::new(Reconciler::new(client, store.clone()));
    let cancel = CancellationToken::new();

    let reconcile_handle = tokio::spawn(reconcile_loop(
        reconciler,
        RefreshTrigger::new(),
        config.reconcile.interval_duration(),
        cancel.clone(),
    ));

    let mut rx = store.subscribe();
    let print_cancel = cancel.clone();
    let printer_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = print_cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let snapshot = rx.borrow_and_update().clone();
                    let pending = snapshot.generated.iter().filter(|r| r.is_pending_schedule()).count();
                    info!(seq = snapshot.seq, generated = snapshot.generated.len(), published = snapshot.published.len(), pending, "history updated");
                    print!("{}", render_history(&snapshot, false));
                }
            }
        }
    });

    wait_for_shutdown().await;
    info!("shutdown signal received");

    cancel.cancel();

    let shutdown_timeout = std::time::Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = reconcile_handle.await;
        let _ = printer_handle.await;
    })
    .await;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler, waiting for Ctrl-C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
