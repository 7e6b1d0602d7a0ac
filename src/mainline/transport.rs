//! The UDP transport under the KRPC protocol.
//!
//! One IPv4 socket per indexing service. Inbound datagrams are decoded into
//! [`Message`]s and handed to the caller's read loop; outbound messages pass
//! through a token bucket so a crawler cannot flood its uplink. A send that
//! finds the bucket empty is dropped and counted, never queued: KRPC is
//! idempotent, so a lost query just yields no response and a lost response
//! wastes one transaction slot on the remote.
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::codec::Message;
use crate::core::statistics;

/// Maximum UDP payload: 65,535 bytes minus the 8-byte UDP header and the
/// 20-byte IP header.
pub const MAX_PACKET_SIZE: usize = 65_507;

/// Error that can occur when binding the transport.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The DHT side of the crawler is IPv4-only.
    #[error("the indexer listen address must be IPv4, got {addr}")]
    NotIpv4 { addr: SocketAddr },

    #[error("could not bind the indexer socket: {source}")]
    Bind { source: std::io::Error },
}

/// A rate limiter: `rate` tokens per second, burst capacity of one second.
struct TokenBucket {
    rate: usize,
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn new(rate: usize) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let tokens = rate as f64;

        Self {
            rate,
            tokens,
            refilled_at: Instant::now(),
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        #[allow(clippy::cast_precision_loss)]
        let rate = self.rate as f64;

        self.tokens = rate.min(self.tokens + now.saturating_duration_since(self.refilled_at).as_secs_f64() * rate);
        self.refilled_at = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// The UDP socket of one indexing service.
pub struct Transport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    bucket: Mutex<TokenBucket>,
    stats_event_sender: Option<Arc<dyn statistics::EventSender>>,
}

impl Transport {
    /// Binds the transport to the given IPv4 address. Port `0` asks the OS
    /// for a random port.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the address is not IPv4 or the socket cannot be
    /// bound.
    pub async fn bind(
        addr: SocketAddr,
        rate_limit: usize,
        stats_event_sender: Option<Arc<dyn statistics::EventSender>>,
    ) -> Result<Self, Error> {
        if !addr.is_ipv4() {
            return Err(Error::NotIpv4 { addr });
        }

        let socket = UdpSocket::bind(addr).await.map_err(|source| Error::Bind { source })?;
        let local_addr = socket.local_addr().map_err(|source| Error::Bind { source })?;

        Ok(Self {
            socket,
            local_addr,
            bucket: Mutex::new(TokenBucket::new(rate_limit)),
            stats_event_sender,
        })
    }

    /// The address the socket is actually bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receives the next syntactically correct KRPC message.
    ///
    /// Zero-length datagrams and datagrams that do not decode are dropped
    /// without surfacing; semantic checks are the protocol layer's job.
    /// `buffer` must be able to hold [`MAX_PACKET_SIZE`] bytes and is reused
    /// across calls by the read loop.
    ///
    /// # Errors
    ///
    /// Will return `Err` when the socket fails, which also happens when it is
    /// closed during termination.
    pub async fn receive(&self, buffer: &mut [u8]) -> std::io::Result<(Message, SocketAddr)> {
        loop {
            let (len, from) = self.socket.recv_from(buffer).await?;

            if len == 0 {
                // Datagram sockets permit zero-length datagrams.
                continue;
            }

            match Message::from_bytes(&buffer[..len]) {
                Ok(message) => return Ok((message, from)),
                Err(err) => {
                    trace!(%from, "dropping an undecodable datagram: {err}");
                }
            }
        }
    }

    /// Sends a message, subject to the egress budget.
    ///
    /// A message that exceeds the budget is dropped and a congestion event is
    /// raised. I/O errors are logged and swallowed; the DHT tolerates lost
    /// packets.
    ///
    /// # Panics
    ///
    /// Panics if the token bucket lock is poisoned or a message built by
    /// this crate fails to encode, both of which are programming errors.
    pub async fn send(&self, message: &Message, to: SocketAddr) {
        let allowed = self
            .bucket
            .lock()
            .expect("the token bucket lock should not be poisoned")
            .try_acquire(Instant::now());

        if !allowed {
            debug!(%to, "egress budget exhausted, dropping an outbound packet");
            self.send_stats_event(statistics::Event::PacketDropped);
            return;
        }

        let data = message.to_bytes().expect("messages built by this crate should encode");

        match self.socket.send_to(&data, to).await {
            Ok(_) => self.send_stats_event(statistics::Event::PacketSent),
            Err(err) => debug!(%to, "could not send a UDP packet: {err}"),
        };
    }

    fn send_stats_event(&self, event: statistics::Event) {
        if let Some(stats_event_sender) = &self.stats_event_sender {
            drop(stats_event_sender.send_event(event));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use serde_bytes::ByteBuf;
    use tokio::time::{advance, Duration, Instant};

    use super::{TokenBucket, Transport, MAX_PACKET_SIZE};
    use crate::mainline::codec::Message;

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn ping() -> Message {
        Message {
            q: Some(String::from("ping")),
            t: ByteBuf::from(*b"aa"),
            y: String::from("q"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn it_should_refuse_an_ipv6_listen_address() {
        let result = Transport::bind("[::1]:0".parse().unwrap(), 100, None).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn it_should_deliver_a_message_end_to_end() {
        let sender = Transport::bind(local(), 100, None).await.unwrap();
        let receiver = Transport::bind(local(), 100, None).await.unwrap();

        sender.send(&ping(), receiver.local_addr()).await;

        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        let (message, from) = receiver.receive(&mut buffer).await.unwrap();

        assert_eq!(message, ping());
        assert_eq!(from, sender.local_addr());
    }

    #[tokio::test]
    async fn it_should_skip_undecodable_datagrams() {
        let receiver = Transport::bind(local(), 100, None).await.unwrap();
        let garbage_sender = tokio::net::UdpSocket::bind(local()).await.unwrap();

        garbage_sender.send_to(b"definitely not bencode", receiver.local_addr()).await.unwrap();

        let sender = Transport::bind(local(), 100, None).await.unwrap();
        sender.send(&ping(), receiver.local_addr()).await;

        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        let (message, from) = receiver.receive(&mut buffer).await.unwrap();

        assert_eq!(message, ping());
        assert_eq!(from, sender.local_addr());
    }

    #[tokio::test(start_paused = true)]
    async fn the_bucket_should_allow_a_full_burst_and_then_run_dry() {
        let mut bucket = TokenBucket::new(3);
        let now = Instant::now();

        assert!(bucket.try_acquire(now));
        assert!(bucket.try_acquire(now));
        assert!(bucket.try_acquire(now));
        assert!(!bucket.try_acquire(now));
    }

    #[tokio::test(start_paused = true)]
    async fn the_bucket_should_refill_over_time() {
        let mut bucket = TokenBucket::new(10);

        for _ in 0..10 {
            assert!(bucket.try_acquire(Instant::now()));
        }
        assert!(!bucket.try_acquire(Instant::now()));

        // 10 packets per second means a fresh token every 100ms; after
        // 150ms there is one whole token and change.
        advance(Duration::from_millis(150)).await;
        assert!(bucket.try_acquire(Instant::now()));
        assert!(!bucket.try_acquire(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn the_bucket_should_never_hold_more_than_its_capacity() {
        let mut bucket = TokenBucket::new(2);

        advance(Duration::from_secs(60)).await;

        assert!(bucket.try_acquire(Instant::now()));
        assert!(bucket.try_acquire(Instant::now()));
        assert!(!bucket.try_acquire(Instant::now()));
    }
}
