use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use mail_intake::admin;
use mail_intake::config::IntakeConfig;
use mail_intake::mail::{NetworkConnector, SmtpMailer};
use mail_intake::scheduler::PollScheduler;
use mail_intake::store::{Database, LibSqlBackend};

/// Grace period for blocking mailbox calls still running at exit. They are
/// abandoned on cancel but hold their socket until it times out.
const BLOCKING_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn main() -> anyhow::Result<()> {
    block_on_with_grace(run(), BLOCKING_SHUTDOWN_GRACE)
}

/// Drive `future` on a fresh runtime, then give leftover blocking tasks at
/// most `grace` before dropping them.
fn block_on_with_grace<F>(future: F, grace: Duration) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let result = runtime.block_on(future);
    runtime.shutdown_timeout(grace);
    result
}

async fn run() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = IntakeConfig::from_env()?;

    eprintln!("📬 Mail Intake v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Poll interval: {}s", config.poll_interval.as_secs());

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Scheduler ────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let scheduler = Arc::new(PollScheduler::new(
        &config,
        Arc::clone(&db),
        Arc::new(NetworkConnector::new(config.network_timeout)),
        Arc::new(SmtpMailer::new(config.network_timeout)),
        cancel.clone(),
    ));
    let poll_handle = Arc::clone(&scheduler).spawn();

    // ── Admin server ─────────────────────────────────────────────────────
    let admin_handle = match config.admin_port {
        Some(port) => {
            let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
                .await
                .with_context(|| format!("Failed to bind admin port {port}"))?;
            eprintln!("   Admin API: http://0.0.0.0:{port}/api/ingest/status");
            let app = admin::routes(Arc::clone(&scheduler));
            let shutdown = cancel.clone();
            Some(tokio::spawn(async move {
                tracing::info!(port, "Admin server started");
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
                {
                    tracing::error!(error = %e, "Admin server failed");
                }
            }))
        }
        None => {
            eprintln!("   Admin API: disabled");
            None
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");
    cancel.cancel();

    poll_handle.await.context("Poll scheduler task failed")?;
    if let Some(handle) = admin_handle {
        handle.await.context("Admin server task failed")?;
    }
    tracing::info!(
        grace_secs = BLOCKING_SHUTDOWN_GRACE.as_secs(),
        "Abandoning in-flight mailbox calls"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn stuck_blocking_call_does_not_hold_up_exit() {
        let started = Instant::now();
        let result = block_on_with_grace(
            async {
                let _ = tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_secs(30)));
                Ok(())
            },
            Duration::from_millis(100),
        );
        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
