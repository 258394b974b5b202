/// Process entry point (§10 ambient stack): loads configuration, wires
/// every concrete dependency (Postgres pool, SQS/SNS bus, transports),
/// spawns the ingress router, one priority-dispatcher/delivery-worker pair
/// per channel, and the HTTP/WS server, then waits for a shutdown signal.
/// Grounded on the teacher's `notification-service/src/main.rs` (tracing
/// init, db pool init, `HttpServer` wiring), trimmed of the Kafka/gRPC/
/// Redis/FCM wiring that has no counterpart in this spec (see DESIGN.md).
use actix_web::{middleware, web, App, HttpServer};
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use notification_fanout::bus::{MessageBus, SqsMessageBus};
use notification_fanout::connections::{
    ConnectionManager, PostgresConnectionRegistry, SharedConnectionRegistry,
};
use notification_fanout::delivery::{push_worker, DeliveryWorker, RetryPolicy};
use notification_fanout::dispatcher::PriorityDispatcher;
use notification_fanout::http;
use notification_fanout::ingress::IngressRouter;
use notification_fanout::metrics;
use notification_fanout::models::Channel;
use notification_fanout::preferences::{PostgresPreferencesStore, SharedPreferencesStore};
use notification_fanout::store::{PostgresEventStore, SharedEventStore};
use notification_fanout::transports::{
    ContactResolver, HttpEmailTransport, HttpSmsTransport, PostgresContactResolver, Transport,
};
use notification_fanout::websocket::routes as ws_routes;
use notification_fanout::Config;
use sqlx::postgres::PgPoolOptions;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting notification-fanout");

    let config = Config::from_env().map_err(io::Error::other)?;

    let db_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_secs))
        .connect(&config.database.url)
        .await
        .map_err(|e| io::Error::other(format!("failed to connect to database: {e}")))?;
    tracing::info!("connected to database");

    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .map_err(|e| io::Error::other(format!("failed to run migrations: {e}")))?;

    let region_provider = RegionProviderChain::default_provider()
        .or_else(aws_config::Region::new(config.bus.region.clone()));
    let mut aws_loader = aws_config::defaults(BehaviorVersion::latest()).region(region_provider);
    if let Some(endpoint) = &config.bus.endpoint_url {
        aws_loader = aws_loader.endpoint_url(endpoint.clone());
    }
    let aws_cfg = aws_loader.load().await;
    let bus: Arc<dyn MessageBus> = Arc::new(SqsMessageBus::new(
        aws_sdk_sqs::Client::new(&aws_cfg),
        aws_sdk_sns::Client::new(&aws_cfg),
    ));

    let event_store: SharedEventStore = Arc::new(PostgresEventStore::new(db_pool.clone()));
    let preferences: SharedPreferencesStore = Arc::new(PostgresPreferencesStore::new(db_pool.clone()));
    let connection_registry: SharedConnectionRegistry =
        Arc::new(PostgresConnectionRegistry::new(db_pool.clone()));
    let contacts: Arc<dyn ContactResolver> = Arc::new(PostgresContactResolver::new(db_pool.clone()));
    let connection_manager = ConnectionManager::new();

    let apns = build_apns_client(&config);

    let retry_policy = RetryPolicy {
        max_retries: config.retry.max_retries,
        backoff_base_secs: config.retry.backoff_base_secs,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    spawn_channel_pipeline(
        Channel::Sms,
        bus.clone(),
        event_store.clone(),
        sms_transport(&config, contacts.clone()),
        retry_policy,
        shutdown_rx.clone(),
    );
    spawn_channel_pipeline(
        Channel::Email,
        bus.clone(),
        event_store.clone(),
        email_transport(&config, contacts.clone()),
        retry_policy,
        shutdown_rx.clone(),
    );
    let push_worker = Arc::new(push_worker(
        bus.clone(),
        event_store.clone(),
        connection_registry.clone(),
        connection_manager.clone(),
        apns,
        retry_policy,
    ));
    spawn_dispatcher(Channel::Push, bus.clone(), push_worker, shutdown_rx.clone());

    let ingress = Arc::new(IngressRouter::new(
        bus.clone(),
        event_store.clone(),
        preferences.clone(),
        connection_registry.clone(),
    ));
    spawn_ingress(ingress, config.bus.ingress_max_messages, config.bus.ingress_wait_seconds, shutdown_rx.clone());

    let http_bind = config.app.http_bind.clone();
    let event_store_data = event_store.clone();
    let bus_data = bus.clone();
    let registry_data = connection_registry.clone();
    let manager_data = connection_manager.clone();

    let server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(metrics::MetricsMiddleware)
            .app_data(web::Data::new(bus_data.clone()))
            .app_data(web::Data::new(event_store_data.clone()))
            .app_data(web::Data::new(registry_data.clone()))
            .app_data(web::Data::new(manager_data.clone()))
            .configure(http::register_routes)
            .configure(ws_routes::register_routes)
            .route("/metrics", web::get().to(metrics::serve_metrics))
    })
    .bind(&http_bind)?
    .run();

    tracing::info!(addr = %http_bind, "http server listening");

    tokio::select! {
        result = server => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    tracing::info!("notification-fanout shutting down");
    Ok(())
}

/// `APNS_CERTIFICATE_PATH` doubles as the `.p8` key path once a key id and
/// team id are also configured; otherwise it is treated as a `.p12`
/// certificate. Push is skipped entirely (with a warning) if neither mode
/// is fully configured, matching the teacher's graceful-degradation
/// pattern for optional external collaborators.
fn build_apns_client(config: &Config) -> Option<Arc<nova_apns_shared::ApnsPush>> {
    let cert_path = config.transports.apns_certificate_path.as_ref()?;
    let apns_config = if !config.transports.apns_key_id.is_empty()
        && !config.transports.apns_team_id.is_empty()
    {
        nova_apns_shared::ApnsConfig::with_token(
            cert_path.clone(),
            config.transports.apns_key_id.clone(),
            config.transports.apns_team_id.clone(),
            config.transports.apns_bundle_id.clone(),
            config.transports.apns_production,
        )
    } else {
        nova_apns_shared::ApnsConfig::new(
            cert_path.clone(),
            config.transports.apns_bundle_id.clone(),
            config.transports.apns_production,
        )
    };
    match nova_apns_shared::ApnsPush::new(&apns_config) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            tracing::warn!(error = %e, "failed to initialize APNs client, push-to-iOS disabled");
            None
        }
    }
}

fn sms_transport(config: &notification_fanout::Config, contacts: Arc<dyn ContactResolver>) -> Arc<dyn Transport> {
    Arc::new(HttpSmsTransport::new(
        config.transports.sms_endpoint.clone(),
        config.transports.sms_basic_auth_user.clone(),
        config.transports.sms_basic_auth_pass.clone(),
        contacts,
    ))
}

fn email_transport(config: &notification_fanout::Config, contacts: Arc<dyn ContactResolver>) -> Arc<dyn Transport> {
    Arc::new(HttpEmailTransport::new(
        config.transports.email_endpoint.clone(),
        config.transports.email_bearer_token.clone(),
        contacts,
    ))
}

fn spawn_channel_pipeline(
    channel: Channel,
    bus: Arc<dyn MessageBus>,
    store: SharedEventStore,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    shutdown_rx: watch::Receiver<bool>,
) {
    let worker = Arc::new(DeliveryWorker::new(channel, bus.clone(), store, transport, policy));
    spawn_dispatcher(channel, bus, worker, shutdown_rx);
}

fn spawn_dispatcher(
    channel: Channel,
    bus: Arc<dyn MessageBus>,
    worker: Arc<DeliveryWorker>,
    shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let dispatcher = PriorityDispatcher::new(bus, channel, worker);
        dispatcher.run(shutdown_rx).await;
    });
}

fn spawn_ingress(
    ingress: Arc<IngressRouter>,
    max_messages: i32,
    wait_seconds: i32,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            if *shutdown_rx.borrow() {
                tracing::info!("ingress router shutting down");
                return;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => continue,
                result = ingress.run_once(max_messages, wait_seconds) => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "ingress run_once failed");
                    }
                }
            }
        }
    });
}
