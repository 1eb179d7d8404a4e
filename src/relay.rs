//! The poll loop.
//!
//! One [`Relay::tick`] services both endpoints once, soil stream first: a pending
//! connection is accepted, or the connection is read until it has nothing queued
//! or `streams.reads_per_tick` reads were made. After the reads the completion
//! invariant is checked; when it holds the record is dispatched,
//! the logger connection is released and both aggregates are reset, whether or
//! not the send succeeded.
//!
//! Decode failures end the loop. Send failures end it only when
//! `cycle.send_failure_fatal` is set.

use crate::config::RelayConfig;
use crate::correlator::{CycleCorrelator, CycleState};
use crate::dispatch::TransportDispatcher;
use crate::error::RelayResult;
use crate::mapper::StreamKind;
use crate::record::CombinedRecord;
use crate::transport::{ReadOutcome, StreamConnection, StreamListener, UnixStreamListener};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing to accept and nothing to read.
    Idle,
    /// Data was consumed or a connection changed.
    Progress,
    /// A cycle completed and its record was handed to the dispatcher.
    Emitted {
        /// The record built from this cycle's means.
        record: CombinedRecord,
        /// The payload that was delivered, `None` if the send failed.
        payload: Option<String>,
    },
}

impl TickOutcome {
    /// True when a cycle was emitted and its payload reached the sink.
    pub fn delivered(&self) -> bool {
        matches!(self, TickOutcome::Emitted { payload: Some(_), .. })
    }
}

/// What happened on one endpoint during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    None,
    Attached,
    Data,
    Closed,
}

/// Owns both listeners, their current connections and the correlator.
pub struct Relay<L: StreamListener> {
    correlator: CycleCorrelator,
    dispatcher: TransportDispatcher,
    logger_listener: L,
    soil_listener: L,
    logger: Option<L::Connection>,
    soil: Option<L::Connection>,
    buf: Vec<u8>,
    reads_per_tick: usize,
    poll_interval: Duration,
    send_failure_fatal: bool,
}

impl<L: StreamListener> std::fmt::Debug for Relay<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("correlator", &self.correlator)
            .field("dispatcher", &self.dispatcher)
            .field("logger_endpoint", &self.logger_listener.endpoint())
            .field("soil_endpoint", &self.soil_listener.endpoint())
            .field("logger_attached", &self.logger.is_some())
            .field("soil_attached", &self.soil.is_some())
            .finish()
    }
}

impl Relay<UnixStreamListener> {
    /// Bind both configured sockets.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: &RelayConfig, dispatcher: TransportDispatcher) -> RelayResult<Self> {
        let logger = UnixStreamListener::bind(&config.streams.logger_socket)?;
        let soil = UnixStreamListener::bind(&config.streams.soil_socket)?;
        Ok(Self::new(logger, soil, config, dispatcher))
    }
}

impl<L: StreamListener> Relay<L> {
    /// Relay over already bound listeners.
    pub fn new(
        logger_listener: L,
        soil_listener: L,
        config: &RelayConfig,
        dispatcher: TransportDispatcher,
    ) -> Self {
        Self {
            correlator: CycleCorrelator::new(&config.streams, &config.cycle),
            dispatcher,
            logger_listener,
            soil_listener,
            logger: None,
            soil: None,
            buf: vec![0; config.streams.read_buffer_bytes.max(1)],
            reads_per_tick: config.streams.reads_per_tick.max(1),
            poll_interval: Duration::from_millis(config.streams.poll_interval_ms.max(1)),
            send_failure_fatal: config.cycle.send_failure_fatal,
        }
    }

    /// The cycle state machine.
    pub fn correlator(&self) -> &CycleCorrelator {
        &self.correlator
    }

    /// Whether a logger producer is currently connected.
    pub fn logger_attached(&self) -> bool {
        self.logger.is_some()
    }

    /// Whether a soil producer is currently connected.
    pub fn soil_attached(&self) -> bool {
        self.soil.is_some()
    }

    /// Run one scheduling tick.
    ///
    /// Returns an error only for conditions that must end the process.
    pub async fn tick(&mut self) -> RelayResult<TickOutcome> {
        let soil = self.service_soil()?;
        let logger = self.service_logger()?;

        if let Some(record) = self.correlator.try_emit() {
            return self.emit(record).await;
        }

        if logger == Activity::Closed {
            let samples = self.correlator.pipeline(StreamKind::Logger).aggregate().sample_count();
            if self.correlator.detach_logger() {
                info!(samples, "logger disconnected before cycle completed");
            } else {
                info!(samples, "logger finished, waiting for soil rows");
            }
        }

        Ok(if soil == Activity::None && logger == Activity::None {
            TickOutcome::Idle
        } else {
            TickOutcome::Progress
        })
    }

    /// Tick on a fixed interval until a fatal error.
    pub async fn run(&mut self) -> RelayResult<()> {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            logger = %self.logger_listener.endpoint(),
            soil = %self.soil_listener.endpoint(),
            sink = self.dispatcher.sink_name(),
            "relay running"
        );

        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                error!(error = %e, "relay stopped");
                return Err(e);
            }
        }
    }

    fn service_soil(&mut self) -> RelayResult<Activity> {
        let Some(conn) = self.soil.as_mut() else {
            return Ok(match accept(&mut self.soil_listener, StreamKind::Soil) {
                Some(conn) => {
                    self.soil = Some(conn);
                    self.correlator.attach_soil();
                    Activity::Attached
                }
                None => Activity::None,
            });
        };

        let activity = drain(
            conn,
            &mut self.buf,
            self.reads_per_tick,
            &mut self.correlator,
            StreamKind::Soil,
        )?;
        if activity == Activity::Closed {
            self.correlator.end_of_stream(StreamKind::Soil);
            self.soil = None;
            info!("soil stream disconnected");
        }
        Ok(activity)
    }

    fn service_logger(&mut self) -> RelayResult<Activity> {
        let Some(conn) = self.logger.as_mut() else {
            if self.correlator.state() != CycleState::AwaitingLoggerConnection {
                return Ok(Activity::None);
            }
            return Ok(match accept(&mut self.logger_listener, StreamKind::Logger) {
                Some(conn) => {
                    self.logger = Some(conn);
                    self.correlator.attach_logger();
                    Activity::Attached
                }
                None => Activity::None,
            });
        };

        let activity = drain(
            conn,
            &mut self.buf,
            self.reads_per_tick,
            &mut self.correlator,
            StreamKind::Logger,
        )?;
        if activity == Activity::Closed {
            self.correlator.end_of_stream(StreamKind::Logger);
            self.logger = None;
        }
        Ok(activity)
    }

    async fn emit(&mut self, record: CombinedRecord) -> RelayResult<TickOutcome> {
        let cycle = self.correlator.cycles_completed() + 1;
        let result = self.dispatcher.send(&record).await;

        self.logger = None;
        self.correlator.finish_cycle();

        match result {
            Ok(payload) => {
                info!(cycle, sink = self.dispatcher.sink_name(), %payload, "cycle emitted");
                Ok(TickOutcome::Emitted {
                    record,
                    payload: Some(payload),
                })
            }
            Err(e) if self.send_failure_fatal => Err(e),
            Err(e) => {
                warn!(cycle, error = %e, "send failed, payload dropped");
                Ok(TickOutcome::Emitted {
                    record,
                    payload: None,
                })
            }
        }
    }
}

fn accept<L: StreamListener>(listener: &mut L, stream: StreamKind) -> Option<L::Connection> {
    match listener.try_accept() {
        Ok(Some(conn)) => {
            info!(%stream, endpoint = %listener.endpoint(), "producer connected");
            Some(conn)
        }
        Ok(None) => None,
        Err(e) => {
            warn!(%stream, error = %e, "accept failed");
            None
        }
    }
}

/// Read and ingest until the connection is empty, closed, or `budget` reads were made.
fn drain<C: StreamConnection>(
    conn: &mut C,
    buf: &mut [u8],
    budget: usize,
    correlator: &mut CycleCorrelator,
    stream: StreamKind,
) -> RelayResult<Activity> {
    let mut activity = Activity::None;
    for _ in 0..budget {
        match read(conn, buf, stream) {
            ReadOutcome::Data(n) => {
                correlator.ingest(stream, &buf[..n])?;
                activity = Activity::Data;
            }
            ReadOutcome::Empty => break,
            ReadOutcome::Closed => return Ok(Activity::Closed),
        }
    }
    Ok(activity)
}

/// A read error on an accepted connection is treated as the producer going away.
fn read<C: StreamConnection>(conn: &mut C, buf: &mut [u8], stream: StreamKind) -> ReadOutcome {
    match conn.try_read(buf) {
        Ok(outcome) => {
            if let ReadOutcome::Data(n) = outcome {
                debug!(%stream, bytes = n, "read");
            }
            outcome
        }
        Err(e) => {
            warn!(%stream, error = %e, "read failed, dropping connection");
            ReadOutcome::Closed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::dispatch::testing::RecordingSink;
    use crate::error::RelayError;
    use crate::transport::{MemoryConnector, MemoryListener};

    struct Harness {
        relay: Relay<MemoryListener>,
        logger: MemoryConnector,
        soil: MemoryConnector,
        sent: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    }

    fn harness(min_logger: u64, fail: bool, fatal: bool) -> Harness {
        let mut config = RelayConfig::default();
        config.streams.logger_header_rows = 1;
        config.streams.soil_header_rows = 1;
        config.cycle.min_logger_samples = min_logger;
        config.cycle.send_failure_fatal = fatal;

        let sink = RecordingSink {
            fail,
            ..RecordingSink::default()
        };
        let sent = sink.sent.clone();
        let (logger_listener, logger) = MemoryListener::new("logger");
        let (soil_listener, soil) = MemoryListener::new("soil");
        let relay = Relay::new(
            logger_listener,
            soil_listener,
            &config,
            TransportDispatcher::new(Box::new(sink)),
        );
        Harness {
            relay,
            logger,
            soil,
            sent,
        }
    }

    async fn tick_until_emitted(relay: &mut Relay<MemoryListener>) -> TickOutcome {
        for _ in 0..50 {
            let outcome = relay.tick().await.unwrap();
            if matches!(outcome, TickOutcome::Emitted { .. }) {
                return outcome;
            }
        }
        panic!("no cycle emitted");
    }

    #[tokio::test]
    async fn idle_without_producers() {
        let mut h = harness(2, false, false);
        assert_eq!(h.relay.tick().await.unwrap(), TickOutcome::Idle);
        assert_eq!(
            h.relay.correlator().state(),
            CycleState::AwaitingLoggerConnection
        );
    }

    #[tokio::test]
    async fn full_cycle_emits_and_releases_logger() {
        let mut h = harness(2, false, false);
        let soil = h.soil.connect();
        soil.write(b"ts,id,vwc,temp,ec\n1700000000,0,0.35,21.6,300\n");
        let logger = h.logger.connect();
        logger.write(b"header\n1,1,1,0,2,120,119,0,2\n1,1,1,0,3,121,120,0,3\n");

        let outcome = tick_until_emitted(&mut h.relay).await;
        assert!(outcome.delivered());
        assert_eq!(
            h.sent.lock().unwrap().as_slice(),
            ["1700000000,120,2,119,2,0.350000,21.600000,300"]
        );
        assert!(!h.relay.logger_attached());
        assert!(h.relay.soil_attached());
        assert_eq!(h.relay.correlator().cycles_completed(), 1);
        assert_eq!(
            h.relay.correlator().state(),
            CycleState::AwaitingLoggerConnection
        );
    }

    #[tokio::test]
    async fn failed_send_still_resets() {
        let mut h = harness(1, true, false);
        let _soil = {
            let p = h.soil.connect();
            p.write(b"h\n5,0,0.2,18.0,90\n");
            p
        };
        let logger = h.logger.connect();
        logger.write(b"h\n5,1,1,0,1,10,10,0,1\n");

        let outcome = tick_until_emitted(&mut h.relay).await;
        assert!(!outcome.delivered());
        assert_eq!(h.relay.correlator().cycles_completed(), 1);
        assert!(!h.relay.correlator().is_complete());
    }

    #[tokio::test]
    async fn fatal_send_failure_stops_the_loop() {
        let mut h = harness(1, true, true);
        let soil = h.soil.connect();
        soil.write(b"h\n5,0,0.2,18.0,90\n");
        let logger = h.logger.connect();
        logger.write(b"h\n5,1,1,0,1,10,10,0,1\n");

        let mut result = Ok(TickOutcome::Idle);
        for _ in 0..20 {
            result = h.relay.tick().await;
            if result.is_err() {
                break;
            }
        }
        let err = result.unwrap_err();
        assert!(matches!(err, RelayError::Network(_)));
    }

    #[tokio::test]
    async fn logger_eof_without_completion_waits_for_reconnect() {
        let mut h = harness(3, false, false);
        let soil = h.soil.connect();
        soil.write(b"h\n1,0,0.1,10.0,100\n");

        let logger = h.logger.connect();
        logger.write(b"h\n1,1,1,0,1,10,10,0,1\n");
        logger.close();
        for _ in 0..6 {
            h.relay.tick().await.unwrap();
        }
        assert!(!h.relay.logger_attached());
        assert_eq!(
            h.relay.correlator().state(),
            CycleState::AwaitingLoggerConnection
        );

        let logger = h.logger.connect();
        logger.write(b"h\n1,1,1,0,1,20,20,0,1\n1,1,1,0,1,30,30,0,1\n");
        let outcome = tick_until_emitted(&mut h.relay).await;
        match outcome {
            TickOutcome::Emitted { record, .. } => assert_eq!(record.voltage1, 20.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn drains_queued_chunks_up_to_the_read_budget() {
        let mut config = RelayConfig::default();
        config.streams.soil_header_rows = 1;
        config.streams.reads_per_tick = 3;
        let (logger_listener, _logger) = MemoryListener::new("logger");
        let (soil_listener, soil) = MemoryListener::new("soil");
        let mut relay = Relay::new(
            logger_listener,
            soil_listener,
            &config,
            TransportDispatcher::new(Box::new(RecordingSink::default())),
        );
        let producer = soil.connect();
        producer.write(b"ts,id,vwc,temp,ec\n");
        for i in 0..5 {
            producer.write(format!("{i},0,0.1,10.0,100\n").as_bytes());
        }
        let samples = |relay: &Relay<MemoryListener>| {
            relay
                .correlator()
                .pipeline(StreamKind::Soil)
                .aggregate()
                .sample_count()
        };

        assert_eq!(relay.tick().await.unwrap(), TickOutcome::Progress);
        assert_eq!(samples(&relay), 0);

        assert_eq!(relay.tick().await.unwrap(), TickOutcome::Progress);
        assert_eq!(samples(&relay), 2);

        assert_eq!(relay.tick().await.unwrap(), TickOutcome::Progress);
        assert_eq!(samples(&relay), 5);

        assert_eq!(relay.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn decode_failure_is_fatal() {
        let mut config = RelayConfig::default();
        config.streams.max_field_bytes = 4;
        let (logger_listener, _logger) = MemoryListener::new("logger");
        let (soil_listener, soil) = MemoryListener::new("soil");
        let mut relay = Relay::new(
            logger_listener,
            soil_listener,
            &config,
            TransportDispatcher::new(Box::new(RecordingSink::default())),
        );
        let producer = soil.connect();
        producer.write(b"1,0,0.123456789,20,1\n");

        relay.tick().await.unwrap();
        let err = relay.tick().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
