use common_kafka::kafka_consumer::BatchConsumer;
use common_kafka::kafka_producer::create_kafka_producer;
use report_worker::app_context::AppContext;
use report_worker::config::Config;
use report_worker::queue_engine::KafkaSink;
use report_worker::server::{router, serve, setup_metrics_routes};
use report_worker::service::ReportService;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// rdkafka reports statistics every 10 seconds, which is what keeps these alive
const KAFKA_LIVENESS_DEADLINE: time::Duration = time::Duration::seconds(30);

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

fn start_health_liveness_server(
    config: &Config,
    context: &AppContext,
) -> Result<JoinHandle<()>, Box<dyn std::error::Error>> {
    let router = setup_metrics_routes(router(context.liveness.clone()))?;
    let bind = config.bind();
    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve health and metrics on {}: {}", bind, e);
        }
    }))
}

async fn shutdown_signal() -> Result<(), std::io::Error> {
    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = interrupt.recv() => info!("received SIGINT"),
    };
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_with_defaults()?;
    let context = AppContext::new(&config).await?;

    let consumer = BatchConsumer::new(
        &config.kafka,
        &config.consumer,
        context
            .liveness
            .register("kafka-consumer", KAFKA_LIVENESS_DEADLINE),
    )?;

    let producer = create_kafka_producer(
        &config.kafka,
        context
            .liveness
            .register("kafka-producer", KAFKA_LIVENESS_DEADLINE),
    )
    .await?;
    let sink = KafkaSink::new(producer, &config.kafka_retry_topic);

    let server = start_health_liveness_server(&config, &context)?;

    let shutdown = CancellationToken::new();
    let service = ReportService::start(&config, &context, consumer, sink, shutdown.clone());

    if let Err(e) = shutdown_signal().await {
        error!("failed to listen for shutdown signals: {}", e);
    }
    info!("shutting down, draining in-flight reports");
    shutdown.cancel();
    service.join().await;

    server.abort();
    info!("shutdown complete");
    Ok(())
}
