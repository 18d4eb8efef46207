use std::process;
use std::thread;
use std::time::Duration;

use crossbeam_channel::tick;
use dash_proto::ServerEvent;
use tracing::{debug, error, info, warn};

use relay_core::pump::BoxedSnapshot;
use relay_core::store::TickTransport;
use relay_core::{
    CachedSnapshotStore, DashboardServer, OrderAggregator, OrderFeed, PubSubSource,
    ReconciliationEngine, RedisPubSub, RelayConfig, SnapshotSource, SourceCapabilities,
    SqliteSnapshotStore, StoreError, TickPump, World,
};

const TARGET: &str = "warehouse_relay::server";
const CLIENT_QUEUE_CAPACITY: usize = 64;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(target: TARGET, error = %err, "config.invalid");
            process::exit(2);
        }
    };

    let mut world = match World::from_file(&config.warehouse_path) {
        Ok(world) => world,
        Err(err) => {
            error!(
                target: TARGET,
                path = %config.warehouse_path.display(),
                error = %err,
                "world.load_failed"
            );
            process::exit(1);
        }
    };
    if let Some(path) = &config.item_names_path {
        if let Err(err) = world.load_item_names(path) {
            warn!(target: TARGET, path = %path.display(), error = %err, "world.item_names_failed");
        }
    }

    let server = match DashboardServer::start(config.bind, &world.payload(), CLIENT_QUEUE_CAPACITY)
    {
        Ok(server) => server,
        Err(err) => {
            error!(target: TARGET, error = %err, "server.start_failed");
            process::exit(1);
        }
    };

    let capabilities = config.profile.capabilities();
    info!(
        target: TARGET,
        bind = %server.local_addr(),
        profile = ?config.profile,
        robots = world.robots().len(),
        width = world.width(),
        height = world.height(),
        "Warehouse relay ready"
    );

    if let Err(err) = spawn_aggregation(&config, capabilities, server.clone()) {
        error!(target: TARGET, error = %err, "orders.start_failed");
        process::exit(1);
    }

    let ticks = match open_pubsub(&config, capabilities) {
        Ok(ticks) => ticks,
        Err(err) => {
            error!(target: TARGET, error = %err, "ticks.start_failed");
            process::exit(1);
        }
    };
    let snapshot = capabilities
        .intersects(SourceCapabilities::ROBOTS_FROM_SNAPSHOT | SourceCapabilities::DT_FROM_SNAPSHOT)
        .then(|| open_snapshot(&config));

    let mut pump = TickPump::new(
        ticks,
        snapshot,
        capabilities,
        ReconciliationEngine::new(world),
    );
    pump.run(&server);
}

fn open_pubsub(
    config: &RelayConfig,
    capabilities: SourceCapabilities,
) -> Result<Box<dyn PubSubSource>, StoreError> {
    let transport = if capabilities.contains(SourceCapabilities::TICK_STREAM) {
        TickTransport::stream()
    } else {
        TickTransport::channel()
    };
    let store = RedisPubSub::new(&config.pubsub_url(), transport, config.store_retry)?;
    Ok(Box::new(store))
}

fn open_snapshot(config: &RelayConfig) -> BoxedSnapshot {
    let source: Box<dyn SnapshotSource> = Box::new(SqliteSnapshotStore::new(
        config.world_db_path.clone(),
        config.store_retry,
    ));
    CachedSnapshotStore::new(source, config.cache_duration)
}

/// Order/station aggregates run on their own thread and connections so a
/// slow aggregation round never delays tick delivery.
fn spawn_aggregation(
    config: &RelayConfig,
    capabilities: SourceCapabilities,
    server: DashboardServer,
) -> Result<(), StoreError> {
    let feed = if capabilities.contains(SourceCapabilities::ORDERS_FROM_SNAPSHOT) {
        OrderFeed::Snapshot(open_snapshot(config))
    } else {
        OrderFeed::PubSub(open_pubsub(config, capabilities)?)
    };
    let interval = config.aggregation_interval.max(Duration::from_millis(10));
    let mut aggregator = OrderAggregator::new(feed, interval, config.order_list_limit);

    thread::Builder::new()
        .name("order-aggregation".into())
        .spawn(move || {
            let ticker = tick(interval);
            while ticker.recv().is_ok() {
                let Some(payload) = aggregator.poll(server.client_count()) else {
                    continue;
                };
                match server.broadcast(&ServerEvent::ImsAllOrders(payload)) {
                    Ok(clients) => debug!(target: TARGET, clients, "orders.broadcast"),
                    Err(err) => warn!(target: TARGET, error = %err, "orders.broadcast_failed"),
                }
            }
        })
        .map_err(|err| StoreError::Unavailable(err.to_string()))?;
    Ok(())
}
