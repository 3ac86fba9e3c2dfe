//! Edge side of the relay: answers collector messages by driving the
//! sensor session.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::error::RelayError;
use super::link::MessageLink;
use super::message::RelayMessage;
use super::poll::PollChannel;
use crate::config::RelayConfig;
use crate::events::{MessageDirection, SessionEvent, SessionObserver};
use crate::retry::{RetryPolicy, retry};
use crate::session::{SessionController, SessionError, SessionState};
use crate::transport::SensorTransport;

/// Opens a fresh relay link after the old one was torn down.
pub type LinkConnector<L> = Box<dyn FnMut() -> Result<L, RelayError> + Send>;

/// Relay parameters of the edge client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    /// Largest chunk served per `BDT_REQ`.
    pub packet_max: usize,
    pub error_threshold: u32,
    pub null_threshold: u32,
    /// Link idle time before the HTTP poll.
    pub poll_interval: Duration,
    pub poll_message: String,
    pub reconnect: RetryPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

impl ClientSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            packet_max: config.packet_max,
            error_threshold: config.error_threshold,
            null_threshold: config.null_threshold,
            poll_interval: config.poll_interval(),
            poll_message: RelayMessage::DevReady.as_str().to_string(),
            reconnect: config.reconnect_policy(),
        }
    }
}

/// Message loop of the edge.
pub struct RelayClient<T: SensorTransport, O: SessionObserver, L: MessageLink> {
    session: SessionController<T, O>,
    link: L,
    settings: ClientSettings,
    connector: Option<LinkConnector<L>>,
    poller: Option<Box<dyn PollChannel>>,
    error_count: u32,
    null_count: u32,
    last_activity: Instant,
}

impl<T: SensorTransport, O: SessionObserver, L: MessageLink> RelayClient<T, O, L> {
    pub fn new(session: SessionController<T, O>, link: L, settings: ClientSettings) -> Self {
        Self {
            session,
            link,
            settings,
            connector: None,
            poller: None,
            error_count: 0,
            null_count: 0,
            last_activity: Instant::now(),
        }
    }

    /// Allow the link to be rebuilt after repeated failures.
    pub fn with_connector(mut self, connector: LinkConnector<L>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_poller(mut self, poller: Box<dyn PollChannel>) -> Self {
        self.poller = Some(poller);
        self
    }

    pub fn session(&self) -> &SessionController<T, O> {
        &self.session
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Serve the collector until `DEV_CLOSE`.
    #[instrument(skip(self))]
    pub fn run(&mut self) -> Result<(), RelayError> {
        info!("Relay client running");
        while self.session.state() != SessionState::Closed {
            if let Err(e) = self.session.idle_keep_alive(Instant::now()) {
                self.session_failed(e)?;
            }
            self.poll_if_quiet();

            match self.link.recv() {
                Ok(None) => continue,
                Ok(Some(text)) if text.is_empty() => {
                    self.null_count += 1;
                    debug!(count = self.null_count, "Empty read");
                    if self.null_count >= self.settings.null_threshold {
                        self.link.close();
                        return Err(RelayError::PeerSilent(self.null_count));
                    }
                }
                Ok(Some(text)) => {
                    self.null_count = 0;
                    self.last_activity = Instant::now();
                    self.emit_message(MessageDirection::Rx, &text);
                    self.dispatch(&text)?;
                }
                Err(e) => self.link_failed(e)?,
            }
        }
        self.link.close();
        info!("Relay client finished");
        Ok(())
    }

    fn dispatch(&mut self, text: &str) -> Result<(), RelayError> {
        let Some(message) = RelayMessage::parse(text) else {
            warn!(text = %text, "Unknown relay message");
            return Ok(());
        };
        match self.handle(message) {
            Ok(()) => Ok(()),
            Err(RelayError::Session(e)) => self.session_failed(e),
            Err(e) if e.is_link_failure() => self.link_failed(e),
            Err(e) => Err(e),
        }
    }

    fn handle(&mut self, message: RelayMessage) -> Result<(), RelayError> {
        match message {
            RelayMessage::DevReady | RelayMessage::DevOpen => {
                info!(message = %message, "Collector alive");
            }
            RelayMessage::SteStart => self.session.start_experiment(false, false)?,
            RelayMessage::SteStop => self.session.stop_experiment()?,
            RelayMessage::SteReq => {
                if self.session.state() == SessionState::Monitoring {
                    let sample = self.session.read_sample()?;
                    let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
                    self.send(&sample.to_row(&stamp))?;
                } else {
                    info!(state = %self.session.state(), "STE_REQ while not monitoring");
                }
            }
            RelayMessage::BdtRun => {
                if self.session.state() == SessionState::Idle {
                    let len = self.session.run_bulk_transfer()?;
                    info!(bytes = len, "Block ready");
                } else {
                    warn!(state = %self.session.state(), "BDT_RUN refused");
                }
            }
            RelayMessage::BdtReq => {
                let chunk = self.session.next_chunk(self.settings.packet_max)?;
                self.send(&chunk)?;
            }
            RelayMessage::BdtEnd => self.send(RelayMessage::BdtEnd.as_str())?,
            RelayMessage::DevClose => {
                info!("Close requested by collector");
                self.session.shutdown()?;
            }
        }
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<(), RelayError> {
        self.link.send(text)?;
        self.error_count = 0;
        self.last_activity = Instant::now();
        self.emit_message(MessageDirection::Tx, text);
        Ok(())
    }

    /// Count a link failure; past the threshold rebuild the link.
    fn link_failed(&mut self, error: RelayError) -> Result<(), RelayError> {
        self.error_count += 1;
        warn!(error = %error, count = self.error_count, "Relay link error");
        if self.error_count <= self.settings.error_threshold {
            return Ok(());
        }
        self.link.close();
        let connector = self.connector.as_mut().ok_or(RelayError::NotConnected)?;
        let link = retry(&self.settings.reconnect, |attempt| match connector() {
            Ok(link) => Ok(Some(link)),
            Err(e) => {
                warn!(attempt, error = %e, "Relay reconnect failed");
                Ok::<_, RelayError>(None)
            }
        })
        .map_err(|e| RelayError::link(e.to_string()))?;
        info!("Relay link rebuilt");
        self.link = link;
        self.error_count = 0;
        self.null_count = 0;
        Ok(())
    }

    /// Radio trouble is cured by a reconnect; anything else is only logged.
    fn session_failed(&mut self, error: SessionError) -> Result<(), RelayError> {
        self.session.observer().on_event(&SessionEvent::Error {
            message: error.to_string(),
        });
        match error {
            e if self.session.state() == SessionState::Closed => {
                warn!(error = %e, "Failure while closing");
                Ok(())
            }
            e if e.needs_recovery() => {
                warn!(error = %e, "Session failure, recovering");
                self.session.recover()?;
                Ok(())
            }
            e => {
                warn!(error = %e, "Request failed");
                Ok(())
            }
        }
    }

    /// Poll the collector over HTTP once the link has been quiet for the
    /// poll interval. A failed poll is reported and retried an interval later.
    fn poll_if_quiet(&mut self) {
        let Some(poller) = self.poller.as_mut() else {
            return;
        };
        if self.last_activity.elapsed() < self.settings.poll_interval {
            return;
        }
        match poller.poll(&self.settings.poll_message) {
            Ok(reply) => debug!(reply = %reply.trim(), "Collector polled"),
            Err(e) => {
                warn!(error = %e, "Collector poll failed");
                self.session.observer().on_event(&SessionEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        self.last_activity = Instant::now();
    }

    fn emit_message(&self, direction: MessageDirection, text: &str) {
        self.session.observer().on_event(&SessionEvent::Message {
            direction,
            text: text.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::bdt::END_OF_DATA;
    use crate::events::testing::RecordingObserver;
    use crate::protocol::ModeConfig;
    use crate::protocol::constants::*;
    use crate::relay::link::testing::ScriptedLink;
    use crate::session::SessionSettings;
    use crate::transport::{MockTransport, SimulatedSensor};

    fn settings() -> ClientSettings {
        ClientSettings {
            reconnect: RetryPolicy::new(Duration::ZERO, 2),
            ..ClientSettings::default()
        }
    }

    fn sim_client(
        link: ScriptedLink,
    ) -> RelayClient<SimulatedSensor, RecordingObserver, ScriptedLink> {
        let mut session_settings = SessionSettings::immediate();
        session_settings.run_time = Duration::from_millis(20);
        let mut session = SessionController::with_observer(
            SimulatedSensor::new("sim").with_notify_interval(Duration::ZERO),
            session_settings,
            Arc::new(RecordingObserver::default()),
        );
        session.connect().unwrap();
        RelayClient::new(session, link, settings())
    }

    #[test]
    fn test_ste_stop_from_idle_sends_nothing() {
        let mock = MockTransport::new();
        let mut empty = ModeConfig::default().to_bytes();
        empty[31..35].copy_from_slice(&(MAX_FLASH as u32).to_le_bytes());
        mock.set_value(STE_CONFIG_HND, &empty);
        let mut session = SessionController::with_observer(
            mock.clone(),
            SessionSettings::immediate(),
            Arc::new(RecordingObserver::default()),
        );
        session.connect().unwrap();
        let link = ScriptedLink::new();
        link.push("STE_STOP");
        link.push("STE_REQ");
        link.push("DEV_CLOSE");
        let mut client = RelayClient::new(session, link.clone(), settings());

        client.run().unwrap();
        assert_eq!(client.session().state(), SessionState::Closed);
        assert!(link.sent().is_empty());
        // Only shutdown touched the device.
        assert!(mock.writes_to(SET_MODE_HND).is_empty());
    }

    #[test]
    fn test_monitoring_exchange() {
        let link = ScriptedLink::new();
        link.push("DEV_READY");
        link.push("STE_START");
        link.push_timeout();
        link.push("STE_REQ");
        link.push("STE_STOP");
        link.push("BDT_END");
        link.push("DEV_CLOSE");
        let mut client = sim_client(link.clone());

        client.run().unwrap();
        let sent = link.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].starts_with('(') && sent[0].ends_with(')'));
        assert_eq!(sent[0].split(',').count(), 12);
        assert_eq!(sent[1], "BDT_END");
        assert!(!client.session().transport().is_running());
        assert_eq!(client.session().state(), SessionState::Closed);
    }

    #[test]
    fn test_bulk_transfer_served_in_chunks() {
        let link = ScriptedLink::new();
        link.push("BDT_RUN");
        for _ in 0..64 {
            link.push("BDT_REQ");
        }
        link.push("DEV_CLOSE");
        let mut client = sim_client(link.clone());
        client.settings.packet_max = 256;

        client.run().unwrap();
        let sent = link.sent();
        let end = sent
            .iter()
            .position(|c| c.contains("End of Data"))
            .expect("no end of data");
        assert!(sent[..=end].iter().all(|c| c.len() <= 256));
        let text: String = sent[..=end].concat();
        assert!(text.starts_with("server time"));
        assert!(text.ends_with(END_OF_DATA));
    }

    #[test]
    fn test_bdt_req_without_block() {
        let link = ScriptedLink::new();
        link.push("BDT_REQ");
        link.push("DEV_CLOSE");
        let mut client = sim_client(link.clone());
        client.run().unwrap();
        assert_eq!(link.sent(), vec![END_OF_DATA.to_string()]);
    }

    #[test]
    fn test_silent_peer_ends_loop() {
        let link = ScriptedLink::new();
        link.push("DEV_READY");
        // script exhausted: every further read is empty
        let mut client = sim_client(link);
        let err = client.run().unwrap_err();
        assert!(matches!(err, RelayError::PeerSilent(3)));
    }

    #[test]
    fn test_link_rebuilt_after_error_threshold() {
        let dead = ScriptedLink::new();
        let mut broken = dead.clone();
        broken.close();

        let fresh = ScriptedLink::new();
        fresh.push("DEV_CLOSE");
        let opened = Arc::new(AtomicU32::new(0));
        let counter = opened.clone();
        let next = fresh.clone();
        let mut client = sim_client(dead).with_connector(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(next.clone())
        }));
        client.settings.error_threshold = 2;

        client.run().unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(client.session().state(), SessionState::Closed);
    }

    /// Poller whose collector never answers.
    struct RefusingPoller {
        calls: Arc<AtomicU32>,
    }

    impl PollChannel for RefusingPoller {
        fn poll(&mut self, _message: &str) -> Result<String, RelayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RelayError::poll("connection refused"))
        }
    }

    #[test]
    fn test_failed_poll_keeps_serving() {
        let link = ScriptedLink::new();
        link.push_timeout();
        link.push("BDT_END");
        link.push_timeout();
        link.push("DEV_CLOSE");
        let calls = Arc::new(AtomicU32::new(0));
        let mut client = sim_client(link.clone()).with_poller(Box::new(RefusingPoller {
            calls: calls.clone(),
        }));
        client.settings.poll_interval = Duration::ZERO;

        client.run().unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(link.sent(), vec!["BDT_END"]);
        assert_eq!(client.session().state(), SessionState::Closed);
        let reported = client
            .session()
            .observer()
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::Error { message } if message.contains("refused")));
        assert!(reported);
    }

    #[test]
    fn test_radio_failure_recovers() {
        let link = ScriptedLink::new();
        link.push("STE_START");
        link.push("DEV_CLOSE");
        let mut client = sim_client(link);
        client.session.transport_mut().drop_link();

        client.run().unwrap();
        let recovered = client
            .session()
            .observer()
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::Error { .. }));
        assert!(recovered);
        assert_eq!(client.session().state(), SessionState::Closed);
    }
}
