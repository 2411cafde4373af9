//! dashfeed-worker: Queue ingestion service
//!
//! Runs one ingestion loop per event kind against RabbitMQ. Records are
//! stored as JSON Lines and republished on the Redis live channel.
//!
//! ## Architecture
//! ```text
//! [RabbitMQ queues] -> [dashfeed-worker] -> [{data_dir}/{topic}.jsonl]
//!                             |
//!                             v
//!                      [Redis pub/sub]
//! ```
//!
//! ## Configuration
//! - DASHFEED__MESSAGING__AMQP__URL: RabbitMQ connection string
//! - DASHFEED__LIVE__REDIS__URL: Redis connection string
//! - DASHFEED__STORAGE__DATA_DIR: Directory for record files
//!
//! Redis is optional: without it records are still ingested, only the
//! live republish is skipped.

use std::sync::Arc;

use tracing::{error, info, warn};

use dashfeed::broker::amqp::{AmqpBroker, AmqpConfig};
use dashfeed::broker::{BrokerQueue, Producer};
use dashfeed::config::Config;
use dashfeed::live::LiveChannel;
use dashfeed::model::{FinancialMetric, Quote, Record, Sale, UserEvent};
use dashfeed::persist::JsonLinesStore;
use dashfeed::utils::bootstrap::{connect_with_retry, init_tracing, parse_config_path};
use dashfeed::utils::shutdown::{self, wait_for_signal};
use dashfeed::worker::{self, Stores};

async fn open_store<R: Record>(
    config: &Config,
) -> Result<Arc<JsonLinesStore<R>>, Box<dyn std::error::Error>> {
    let store =
        JsonLinesStore::open(&config.storage.data_dir, config.topics.name(R::KIND)).await?;
    info!(kind = %R::KIND, path = %store.path().display(), "Opened record store");
    Ok(Arc::new(store))
}

#[cfg(feature = "redis")]
async fn connect_live(config: &Config) -> Option<Arc<dyn LiveChannel>> {
    use dashfeed::live::RedisLive;

    match RedisLive::connect(&config.live.redis.url).await {
        Ok(live) => Some(Arc::new(live)),
        Err(e) => {
            warn!(error = %e, "Redis unavailable, live republish disabled");
            None
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_live(_config: &Config) -> Option<Arc<dyn LiveChannel>> {
    warn!("Built without redis support, live republish disabled");
    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting dashfeed-worker");

    let amqp = AmqpConfig {
        url: config.messaging.amqp.url.clone(),
        prefetch: config.messaging.amqp.prefetch,
    };
    let broker =
        connect_with_retry("rabbitmq", &amqp.url, || AmqpBroker::connect(amqp.clone())).await?;
    let broker: Arc<dyn BrokerQueue> = Arc::new(broker);
    Producer::new(Arc::clone(&broker), config.topics.clone())
        .declare_all()
        .await?;

    let live = connect_live(&config).await;

    let stores = Stores {
        quote: open_store::<Quote>(&config).await?,
        sale: open_store::<Sale>(&config).await?,
        user_event: open_store::<UserEvent>(&config).await?,
        financial_metric: open_store::<FinancialMetric>(&config).await?,
    };

    let (trigger, signal) = shutdown::channel();
    let workers = worker::spawn_all(
        &config.topics,
        broker,
        live,
        stores,
        config.worker.batch_settings(),
        signal,
    );

    info!("Worker running, press Ctrl+C to exit");
    wait_for_signal().await;
    trigger.trigger();

    for handle in workers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Ingestion worker failed"),
            Err(e) => error!(error = %e, "Ingestion worker panicked"),
        }
    }

    info!("dashfeed-worker stopped");
    Ok(())
}
