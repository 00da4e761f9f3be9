use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use axum::Router;
use jobbus::{
    db, handlers, jobs,
    models::{AppState, Error, Settings},
    services::RunOutcome,
};
use opentelemetry::trace::TracerProvider;
use tokio::signal;
use tower_http::trace::TraceLayer;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod flags {
    xflags::xflags! {
        cmd jobbus {
            /// Serve the HTTP API and run queued jobs.
            default cmd serve {}
            /// Create the queue tables.
            cmd migrate {}
            /// Drain the queue once and print the report.
            cmd run-once {}
            /// Enqueue a job; the payload is a JSON document.
            cmd enqueue {
                required job_type: String
                optional payload: String
                optional --delay secs: i64
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let flags = flags::Jobbus::from_env_or_exit();

    // Create a new OpenTelemetry trace pipeline that prints to stdout
    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .build();

    let tracer = provider.tracer("jobbus");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobbus=debug,tower_http=debug".into()),
        )
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(flags).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(flags: flags::Jobbus) -> Result<(), Error> {
    let settings = Settings::from_env()?;
    let registry = jobs::builtin();
    debug!({ job_types = ?registry.job_types().collect::<Vec<_>>() }, "handlers registered");
    let state = AppState::new(settings, registry).await?;
    match flags.subcommand {
        flags::JobbusCmd::Serve(_) => {
            db::create_schema(&state.pool).await?;
            let (http, trigger) = tokio::join!(
                start_http_server(&state),
                start_trigger_service(&state)
            );
            http?;
            trigger?;
            warn!({ instance_id = state.instance_id }, "shutdown");
        }
        flags::JobbusCmd::Migrate(_) => {
            db::create_schema(&state.pool).await?;
            info!({ instance_id = state.instance_id }, "schema created");
        }
        flags::JobbusCmd::RunOnce(_) => match state.runner.run().await? {
            RunOutcome::Locked => println!("locked"),
            RunOutcome::Completed(report) => println!("{}", serde_json::to_string(&report)?),
        },
        flags::JobbusCmd::Enqueue(cmd) => {
            let payload = serde_json::from_str(cmd.payload.as_deref().unwrap_or("null"))?;
            let job_id = state
                .queue
                .enqueue_in(&cmd.job_type, payload, cmd.delay.unwrap_or(0))
                .await?;
            println!("{}", job_id);
        }
    }
    Ok(())
}

async fn start_http_server(state: &Arc<AppState>) -> Result<(), Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.settings.http_port));
    let app = Router::new()
        .merge(handlers::live::routes(Arc::clone(state)))
        .nest("/api/v1", handlers::jobs::routes(Arc::clone(state)))
        .layer(TraceLayer::new_for_http());

    let res = serve_http(state, addr, app).await;
    if res.is_err() {
        state.shutdown_token.cancel();
    }
    res
}

async fn serve_http(state: &Arc<AppState>, addr: SocketAddr, app: Router) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!({ instance_id = state.instance_id, %addr }, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(state)))
        .await?;
    Ok(())
}

async fn start_trigger_service(state: &Arc<AppState>) -> Result<(), Error> {
    let service = state.trigger_service();
    service.run().await
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = state.shutdown_token.cancelled() => {},
    }
    state.shutdown_token.cancel();
    tracing::warn!("signal received, starting graceful shutdown");
}
