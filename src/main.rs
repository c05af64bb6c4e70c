use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use reply_relay::api::workflow_routes;
use reply_relay::channels::{
    EmailMonitorClient, HttpGenerator, ItemSource, SmsGatewayClient, SmtpDelivery,
    spawn_item_poller,
};
use reply_relay::config::{ServiceConfig, WorkflowConfig};
use reply_relay::store::{LibSqlBackend, WorkflowStore};
use reply_relay::workflow::{WorkflowDeps, WorkflowEngine, spawn_timeout_sweeper};

/// Initialize tracing: stderr always, plus a daily-rolling file when
/// `log_dir` is set. The returned guard must live as long as the process.
fn init_tracing(
    log_dir: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "reply-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let service = ServiceConfig::from_env().context("Invalid service configuration")?;
    let _log_guard = init_tracing(service.log_dir.as_deref());
    let workflow = WorkflowConfig::from_env().context("Invalid workflow configuration")?;
    service
        .smtp
        .check_call_timeout(workflow.retry.call_timeout)
        .context("Invalid SMTP configuration")?;

    eprintln!("📨 Reply Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Email monitor: {}", service.email_monitor_url);
    eprintln!("   Generator: {}", service.generator_url);
    eprintln!("   SMS gateway: {}", service.sms_gateway_url);
    eprintln!("   SMTP: {}:{}", service.smtp.host, service.smtp.port);
    eprintln!(
        "   Limits: {} edits, {} attempts, {}s reply window",
        workflow.max_edit_iterations,
        workflow.max_retry_attempts,
        workflow.response_timeout.as_secs()
    );

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn WorkflowStore> = Arc::new(
        LibSqlBackend::new_local(&service.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", service.db_path.display()))?,
    );
    eprintln!("   Database: {}", service.db_path.display());

    // ── Collaborators ────────────────────────────────────────────────────
    let source: Arc<dyn ItemSource> = Arc::new(EmailMonitorClient::new(&service.email_monitor_url));
    let deps = WorkflowDeps {
        store,
        generator: Arc::new(HttpGenerator::new(&service.generator_url)),
        notifier: Arc::new(SmsGatewayClient::new(
            &service.sms_gateway_url,
            workflow.notification_format,
        )),
        delivery: Arc::new(SmtpDelivery::new(service.smtp.clone())),
        source: Some(Arc::clone(&source)),
    };
    let engine = Arc::new(WorkflowEngine::new(workflow, deps));

    // ── Startup recovery: re-drive anything left in flight ──────────────
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            match engine.recover().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(count = n, "Recovered in-flight workflows"),
                Err(e) => tracing::error!(error = %e, "Startup recovery failed"),
            }
        });
    }

    // ── Background tasks ─────────────────────────────────────────────────
    let _poller = spawn_item_poller(
        Arc::clone(&engine),
        source,
        service.poll_interval,
        service.max_items_per_poll,
    );
    let _sweeper = spawn_timeout_sweeper(Arc::clone(&engine), service.sweep_interval);
    eprintln!(
        "   Poll every {}s (max {} items), sweep every {}s",
        service.poll_interval.as_secs(),
        service.max_items_per_poll,
        service.sweep_interval.as_secs()
    );

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = workflow_routes(Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", service.port))
        .await
        .with_context(|| format!("Failed to bind port {}", service.port))?;
    eprintln!("   HTTP: http://0.0.0.0:{}\n", service.port);
    tracing::info!(port = service.port, "Reply relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;

    Ok(())
}
