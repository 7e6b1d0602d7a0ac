//! The crawler manager: owns the indexing services and their output.
//!
//! One [`IndexingService`] is started per configured bind address; all of
//! them funnel their discoveries into a single bounded channel. The channel
//! is the intentional backpressure point: when the consumer falls behind,
//! new discoveries are dropped rather than letting anything block the UDP
//! read path. The DHT will offer the same infohashes again soon enough.
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::protocol::Protocol;
use super::service::{IndexingService, OnResult};
use super::transport::Transport;
use super::Discovery;
use crate::core::statistics;

/// Capacity of the discovery channel between the indexers and the sink.
const DISCOVERY_CHANNEL_CAPACITY: usize = 20;

/// Errors starting the manager.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] super::transport::Error),
}

/// The running DHT side: services, their tasks and the discovery channel.
pub struct Manager {
    output: Option<mpsc::Receiver<Discovery>>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Manager {
    /// Binds one indexing service per configured address and starts them.
    ///
    /// # Errors
    ///
    /// Will return `Err` if any indexer socket cannot be bound (including a
    /// non-IPv4 listen address).
    pub async fn start(
        config: &magpie_configuration::Crawler,
        stats_event_sender: Option<Arc<dyn statistics::EventSender>>,
    ) -> Result<Self, Error> {
        let (output_tx, output_rx) = mpsc::channel(DISCOVERY_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handles = Vec::new();

        for addr in &config.indexer_addrs {
            let transport = Transport::bind(*addr, config.rate_limit, stats_event_sender.clone()).await?;
            let protocol = Arc::new(Protocol::new(transport));

            let service = Arc::new(IndexingService::new(
                protocol,
                config.interval(),
                config.max_neighbors,
                config.bootstrap_nodes.clone(),
                discovery_forwarder(output_tx.clone(), stats_event_sender.clone()),
            ));

            handles.extend(service.start(&shutdown_rx));
        }

        Ok(Self {
            output: Some(output_rx),
            shutdown: shutdown_tx,
            handles,
        })
    }

    /// Hands out the consumer side of the discovery channel. Single
    /// consumer; can only be taken once.
    ///
    /// # Panics
    ///
    /// Panics when called a second time.
    #[must_use]
    pub fn output(&mut self) -> mpsc::Receiver<Discovery> {
        self.output.take().expect("the discovery channel consumer can only be taken once")
    }

    /// Signals every service task to stop and waits for them to finish.
    pub async fn terminate(self) {
        drop(self.shutdown.send(true));

        for handle in self.handles {
            handle.abort();
            drop(handle.await);
        }
    }
}

/// Builds the `OnResult` handler the services get: forward into the bounded
/// channel, drop on full.
fn discovery_forwarder(
    output_tx: mpsc::Sender<Discovery>,
    stats_event_sender: Option<Arc<dyn statistics::EventSender>>,
) -> OnResult {
    Box::new(move |discovery| {
        let event = match output_tx.try_send(discovery) {
            Ok(()) => statistics::Event::DiscoveryEmitted,
            Err(TrySendError::Full(discovery)) => {
                debug!(info_hash = %discovery.info_hash, "the discovery channel is full, dropping a discovery");
                statistics::Event::DiscoveryDropped
            }
            // The consumer is gone; the crawler is shutting down.
            Err(TrySendError::Closed(_)) => return,
        };

        if let Some(stats_event_sender) = &stats_event_sender {
            drop(stats_event_sender.send_event(event));
        }
    })
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use magpie_primitives::info_hash::InfoHash;
    use tokio::sync::mpsc;

    use super::{discovery_forwarder, Manager, DISCOVERY_CHANNEL_CAPACITY};
    use crate::core::statistics::{Event, MockEventSender};
    use crate::mainline::Discovery;

    fn discovery(n: u8) -> Discovery {
        Discovery {
            info_hash: InfoHash::from([n; 20]),
            peers: vec!["5.6.7.8:51413".parse::<SocketAddr>().unwrap()],
        }
    }

    #[tokio::test]
    async fn a_discovery_past_the_channel_capacity_should_be_dropped_not_queued() {
        let (tx, mut rx) = mpsc::channel(DISCOVERY_CHANNEL_CAPACITY);

        let mut stats = MockEventSender::new();
        stats
            .expect_send_event()
            .withf(|event| *event == Event::DiscoveryEmitted)
            .times(20)
            .returning(|_| None);
        stats
            .expect_send_event()
            .withf(|event| *event == Event::DiscoveryDropped)
            .times(1)
            .returning(|_| None);

        let forward = discovery_forwarder(tx, Some(Arc::new(stats)));

        // 20 fit, the 21st is dropped without blocking.
        for n in 0..21 {
            forward(discovery(n));
        }

        let mut delivered = Vec::new();
        while let Ok(item) = rx.try_recv() {
            delivered.push(item);
        }

        assert_eq!(delivered.len(), DISCOVERY_CHANNEL_CAPACITY);
        assert_eq!(delivered.first(), Some(&discovery(0)));
        assert_eq!(delivered.last(), Some(&discovery(19)));
    }

    #[tokio::test]
    async fn the_manager_should_start_and_terminate_cleanly() {
        let config = magpie_configuration::Crawler {
            indexer_addrs: vec!["127.0.0.1:0".parse().unwrap()],
            bootstrap_nodes: Vec::new(),
            ..Default::default()
        };

        let mut manager = Manager::start(&config, None).await.unwrap();
        let output = manager.output();

        manager.terminate().await;
        drop(output);
    }

    #[tokio::test]
    async fn the_manager_should_refuse_an_ipv6_indexer_address() {
        let config = magpie_configuration::Crawler {
            indexer_addrs: vec!["[::1]:0".parse().unwrap()],
            bootstrap_nodes: Vec::new(),
            ..Default::default()
        };

        assert!(Manager::start(&config, None).await.is_err());
    }
}
