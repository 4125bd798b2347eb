use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio::signal;
use tracing::{info, warn};

use event_processor::api::{self, AppState};
use event_processor::cache::{RecentActivityCache, RedisListCache};
use event_processor::config::Config;
use event_processor::dispatch::{Dispatcher, WorkTimings};
use event_processor::fault::FaultInjector;
use event_processor::health::{ComponentStatus, HealthRegistry};
use event_processor::intake::{IntakeLoop, IntakeSettings};
use event_processor::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use event_processor::notify::{HttpNotifier, Notifier, SimulatedNotifier};
use event_processor::pipeline::EventPipeline;
use event_processor::store::{IdempotentStore, PostgresDocumentStore};
use event_processor::stream::{EventStream, KafkaEventStream};
use event_processor::supervisor::ProcessingSupervisor;
use event_processor::telemetry::setup_tracing;

// A batch can take a while with injected latency, the deadline leaves room for that
const INTAKE_LIVENESS_DEADLINE: Duration = Duration::from_secs(60);

async fn shutdown_signal() {
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {},
        _ = terminate => {},
    };
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().context("Invalid configuration")?;
    config.validate().context("Invalid configuration")?;
    setup_tracing(&config).context("Failed to initialize tracing")?;
    info!(service = event_processor::SERVICE_NAME, "Starting event processor");

    let recorder_handle = setup_metrics_recorder().context("Failed to install metrics recorder")?;
    let injector = FaultInjector::new(config.failure_injection_policy());
    let liveness = HealthRegistry::new("liveness");

    let stream: Arc<dyn EventStream> =
        Arc::new(KafkaEventStream::new(&config).context("Failed to create Kafka consumer")?);

    let store = match &config.database_url {
        Some(url) => {
            let backend = PostgresDocumentStore::connect(
                url,
                config.max_pg_connections,
                &config.document_collection,
            )
            .await
            .context("Failed to initialize document store")?;
            Some(IdempotentStore::new(Arc::new(backend), injector.clone()))
        }
        None => {
            warn!("DATABASE_URL not set, processed events will not be persisted");
            None
        }
    };

    let cache = match &config.redis_url {
        Some(url) => {
            let backend = RedisListCache::connect(url)
                .await
                .context("Failed to initialize recent activity cache")?;
            Some(RecentActivityCache::new(Arc::new(backend), injector.clone()))
        }
        None => {
            warn!("REDIS_URL not set, recent activity will not be cached");
            None
        }
    };

    let notifier: Arc<dyn Notifier> = match &config.notification_service_url {
        Some(url) => Arc::new(
            HttpNotifier::new(url, config.notification_timeout())
                .context("Failed to create notification client")?,
        ),
        None => Arc::new(SimulatedNotifier::default()),
    };

    let dispatcher = Arc::new(Dispatcher::new(notifier, WorkTimings::default()));
    let pipeline = EventPipeline::new(injector.clone(), dispatcher, store, cache.clone());

    let intake_liveness = liveness
        .register("intake", INTAKE_LIVENESS_DEADLINE)
        .await;
    intake_liveness.report_status(ComponentStatus::Idle).await;
    let intake = IntakeLoop::new(
        stream,
        pipeline,
        IntakeSettings {
            max_batch_size: config.max_batch_size,
            max_wait: config.max_wait_time(),
        },
    )
    .with_liveness(intake_liveness);

    let supervisor = Arc::new(ProcessingSupervisor::new(
        intake,
        injector,
        config.shutdown_timeout(),
    ));
    if config.auto_start {
        supervisor.start().await?;
    }

    let router = api::router(AppState {
        supervisor: supervisor.clone(),
        cache,
        liveness,
    });
    let router = setup_metrics_routes(router, recorder_handle);

    let bind = config.bind_address();
    info!(address = %bind, "Control API listening");
    tokio::select! {
        result = serve(router, &bind) => result.context("Control API server failed")?,
        _ = shutdown_signal() => {},
    }

    supervisor.stop().await;
    info!("Event processor shut down");
    Ok(())
}
