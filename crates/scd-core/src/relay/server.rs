//! Collector side of the relay.
//!
//! Holds one edge connection at a time and serializes monitoring and
//! bulk-transfer requests from any number of callers through two locks.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{debug, info, instrument, warn};

use super::capture::Capture;
use super::error::RelayError;
use super::link::{MessageLink, TcpLink};
use super::message::RelayMessage;
use crate::config::RelayConfig;
use crate::protocol::SAMPLE_ROW_COLUMNS;

/// Payload returned when a bulk transfer request hits a held lock.
pub const BDT_BUSY: &str = "somebody is running BDT or STE";

/// Accept poll granularity while waiting for the edge.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Source of edge connections.
pub trait LinkAcceptor: Send {
    type Link: MessageLink;

    /// Wait up to `timeout` for the edge. `Ok(None)` on timeout.
    fn accept(&mut self, timeout: Duration) -> Result<Option<Self::Link>, RelayError>;

    /// Drop and re-create the listening socket.
    fn reopen(&mut self) -> Result<(), RelayError>;
}

/// Non-blocking `TcpListener` polled until the accept deadline.
pub struct TcpAcceptor {
    address: SocketAddr,
    listener: Option<TcpListener>,
    recv_timeout: Duration,
    packet_max: usize,
}

impl TcpAcceptor {
    pub fn bind(
        address: &str,
        recv_timeout: Duration,
        packet_max: usize,
    ) -> Result<Self, RelayError> {
        let listener = Self::listen(address)?;
        let address = listener.local_addr()?;
        info!(address = %address, "Collector listening");
        Ok(Self {
            address,
            listener: Some(listener),
            recv_timeout,
            packet_max,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    fn listen<A: std::net::ToSocketAddrs>(address: A) -> Result<TcpListener, RelayError> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }
}

impl LinkAcceptor for TcpAcceptor {
    type Link = TcpLink;

    fn accept(&mut self, timeout: Duration) -> Result<Option<TcpLink>, RelayError> {
        let listener = self.listener.as_ref().ok_or(RelayError::NotConnected)?;
        let deadline = Instant::now() + timeout;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "Edge connected");
                    return TcpLink::from_stream(stream, self.recv_timeout, self.packet_max)
                        .map(Some);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn reopen(&mut self) -> Result<(), RelayError> {
        self.listener = None;
        self.listener = Some(Self::listen(self.address)?);
        debug!(address = %self.address, "Listener reopened");
        Ok(())
    }
}

/// Relay parameters of the collector.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub accept_timeout: Duration,
    /// Lifetime of an accepted connection.
    pub keep_time: Duration,
    pub error_threshold: u32,
    /// Consecutive end-of-stream reads before the edge counts as gone.
    pub null_threshold: u32,
    /// Pause around each monitoring exchange.
    pub step_delay: Duration,
    /// Recording time granted to the edge between `BDT_RUN` and `BDT_END`.
    pub run_delay: Duration,
    /// Longest wait for the edge to answer a bulk transfer message.
    pub bdt_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

impl ServerSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            accept_timeout: config.accept_timeout(),
            keep_time: config.keep_time(),
            error_threshold: config.error_threshold,
            null_threshold: config.null_threshold,
            step_delay: Duration::from_millis(200),
            run_delay: config.bdt_run_delay(),
            bdt_timeout: Duration::from_secs(120),
        }
    }
}

/// Identity of whoever asked the collector for something.
pub type CallerId = String;

/// Owners of the monitoring and bulk transfer locks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockTable {
    pub ste: Option<CallerId>,
    pub bdt: Option<CallerId>,
}

impl LockTable {
    pub fn any_held(&self) -> bool {
        self.ste.is_some() || self.bdt.is_some()
    }

    fn monitor_blocked(&self, caller: &str) -> bool {
        self.bdt.is_some() || self.ste.as_deref().is_some_and(|owner| owner != caller)
    }
}

/// Vibration classification from the three accelerometer variances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VibrationStatus {
    Abnormal,
    Normal,
    Stopped,
    Noisy,
}

impl VibrationStatus {
    pub fn classify(variances: [f64; 3]) -> Self {
        let max = variances.iter().copied().fold(f64::MIN, f64::max);
        if max >= 0.7 || variances.iter().all(|v| *v > 0.2) {
            VibrationStatus::Abnormal
        } else if max >= 0.2 {
            VibrationStatus::Normal
        } else if variances.iter().all(|v| *v == 0.0) {
            VibrationStatus::Stopped
        } else {
            VibrationStatus::Noisy
        }
    }

    /// Motion and health labels.
    pub fn labels(&self) -> [&'static str; 2] {
        match self {
            VibrationStatus::Abnormal => ["VIBRATION", "ABNORMAL"],
            VibrationStatus::Normal => ["VIBRATION", "NORMAL"],
            VibrationStatus::Stopped => ["STOP", "NORMAL"],
            VibrationStatus::Noisy => ["STOP(noisy)", "UNKNOWN"],
        }
    }
}

/// Answer to a monitoring request.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorReply {
    /// Always [`SAMPLE_ROW_COLUMNS`] columns.
    pub row: Vec<String>,
    pub status: [String; 2],
    /// Whether the caller should keep polling.
    pub timer: bool,
    pub rejected: bool,
}

impl MonitorReply {
    fn filled(fill: &str, status: [&str; 2], timer: bool) -> Self {
        let mut row = vec![time_stamp()];
        row.resize(SAMPLE_ROW_COLUMNS, fill.to_string());
        Self {
            row,
            status: status.map(str::to_string),
            timer,
            rejected: false,
        }
    }

    pub fn rejected() -> Self {
        Self {
            rejected: true,
            ..Self::filled("*", ["[monitoring runs]", "[by other user]"], false)
        }
    }

    /// Nothing to show yet, or the edge did not answer.
    pub fn placeholder() -> Self {
        Self::filled("?", ["-?-", "-?-"], true)
    }

    pub fn stopped() -> Self {
        Self::filled("*", ["---", "---"], false)
    }

    /// Parse an edge sample row `(time,mx,vx,my,vy,mz,vz,t,l,gx,gy,gz)`.
    pub fn from_sample(text: &str) -> Option<Self> {
        let row: Vec<String> = text
            .replace(['(', ')'], "")
            .split(',')
            .map(|c| c.trim().to_string())
            .collect();
        if row.len() != SAMPLE_ROW_COLUMNS {
            return None;
        }
        let variance = |i: usize| row[i].parse::<f64>().ok();
        let variances = [variance(2)?, variance(4)?, variance(6)?];
        let status = VibrationStatus::classify(variances).labels();
        Some(Self {
            row,
            status: status.map(str::to_string),
            timer: true,
            rejected: false,
        })
    }
}

/// Answer to a bulk transfer request.
#[derive(Debug, Clone, PartialEq)]
pub enum BdtReply {
    /// Finished at the given time stamp.
    Done(String),
    /// A lock was held; nothing was sent to the edge.
    Rejected(&'static str),
    Failed(String),
}

/// Collector engine.
pub struct RelayServer<A: LinkAcceptor> {
    acceptor: A,
    link: Option<A::Link>,
    settings: ServerSettings,
    locks: LockTable,
    monitoring: bool,
    connected_at: Instant,
    error_count: u32,
    null_count: u32,
    capture: Option<Capture>,
}

impl<A: LinkAcceptor> RelayServer<A> {
    pub fn new(acceptor: A, settings: ServerSettings) -> Self {
        Self {
            acceptor,
            link: None,
            settings,
            locks: LockTable::default(),
            monitoring: false,
            connected_at: Instant::now(),
            error_count: 0,
            null_count: 0,
            capture: None,
        }
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Block from the last successful fetch.
    pub fn capture(&self) -> Option<&Capture> {
        self.capture.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(|l| l.is_open())
    }

    /// Make sure an unexpired edge connection is available.
    #[instrument(skip(self))]
    pub fn accept(&mut self) -> Result<(), RelayError> {
        if self.is_connected() && self.connected_at.elapsed() > self.settings.keep_time {
            info!("Edge connection expired");
            self.drop_link()?;
        }
        if self.is_connected() {
            return Ok(());
        }
        match self.acceptor.accept(self.settings.accept_timeout)? {
            Some(link) => {
                self.link = Some(link);
                self.connected_at = Instant::now();
                self.error_count = 0;
                self.null_count = 0;
                Ok(())
            }
            None => {
                warn!("No edge connection before the accept timeout");
                Err(RelayError::NotConnected)
            }
        }
    }

    fn drop_link(&mut self) -> Result<(), RelayError> {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.acceptor.reopen()
    }

    /// Count a link failure; past the threshold close and re-open.
    fn link_failed(&mut self, error: &RelayError) {
        self.error_count += 1;
        warn!(error = %error, count = self.error_count, "Relay link error");
        if self.error_count > self.settings.error_threshold {
            warn!("Too many link errors, re-opening");
            self.error_count = 0;
            if let Err(e) = self.drop_link() {
                warn!(error = %e, "Re-open failed");
            }
        }
    }

    fn send(&mut self, message: RelayMessage) -> Result<(), RelayError> {
        self.accept()?;
        let link = self.link.as_mut().ok_or(RelayError::NotConnected)?;
        debug!(message = %message, "Relay TX");
        match link.send(message.as_str()) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.link_failed(&e);
                Err(e)
            }
        }
    }

    /// One read. Timeouts and failures read as an empty message.
    ///
    /// An end-of-stream read counts as a link failure; enough of them in a
    /// row drop the connection.
    fn recv(&mut self) -> String {
        let Some(link) = self.link.as_mut() else {
            return String::new();
        };
        match link.recv() {
            Ok(Some(text)) if text.is_empty() => {
                self.null_count += 1;
                self.link_failed(&RelayError::link("edge closed the connection"));
                if self.null_count >= self.settings.null_threshold && self.link.is_some() {
                    warn!(count = self.null_count, "Edge gone, dropping connection");
                    self.null_count = 0;
                    if let Err(e) = self.drop_link() {
                        warn!(error = %e, "Re-open failed");
                    }
                }
                String::new()
            }
            Ok(Some(text)) => {
                self.null_count = 0;
                text
            }
            Ok(None) => String::new(),
            Err(e) => {
                self.link_failed(&e);
                String::new()
            }
        }
    }

    /// Read until something non-empty arrives or `timeout` passes.
    fn recv_within(&mut self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let text = self.recv();
            if !text.is_empty() {
                return Some(text);
            }
            if Instant::now() >= deadline || !self.is_connected() {
                return None;
            }
        }
    }

    /// Start monitoring, or fetch the next sample of a running one.
    #[instrument(skip(self))]
    pub fn monitor_start(&mut self, caller: &str) -> MonitorReply {
        if self.locks.monitor_blocked(caller) {
            debug!(ste = ?self.locks.ste, bdt = ?self.locks.bdt, "Monitor request rejected");
            return MonitorReply::rejected();
        }
        self.locks.ste = Some(caller.to_string());

        pause(self.settings.step_delay);
        if !self.monitoring {
            if self.send(RelayMessage::SteStart).is_ok() {
                self.monitoring = true;
            }
            return MonitorReply::placeholder();
        }
        if self.send(RelayMessage::SteReq).is_err() {
            return MonitorReply::placeholder();
        }
        pause(self.settings.step_delay);
        let text = self.recv();
        MonitorReply::from_sample(&text).unwrap_or_else(|| {
            debug!(reply = %text, "No usable sample");
            MonitorReply::placeholder()
        })
    }

    /// Stop monitoring and release the lock.
    #[instrument(skip(self))]
    pub fn monitor_stop(&mut self, caller: &str) -> MonitorReply {
        if self.locks.ste.as_deref().is_some_and(|owner| owner != caller) {
            return MonitorReply::rejected();
        }
        if self.monitoring {
            pause(self.settings.step_delay);
            if let Err(e) = self.send(RelayMessage::SteStop) {
                warn!(error = %e, "STE_STOP not delivered");
            }
            self.monitoring = false;
        }
        self.locks.ste = None;
        MonitorReply::stopped()
    }

    /// Have the edge record and pull a block.
    #[instrument(skip(self))]
    pub fn run_bdt(&mut self, caller: &str) -> BdtReply {
        if self.locks.any_held() {
            return BdtReply::Rejected(BDT_BUSY);
        }
        self.locks.bdt = Some(caller.to_string());
        let reply = self.try_run_bdt();
        self.locks.bdt = None;
        reply
    }

    fn try_run_bdt(&mut self) -> BdtReply {
        if let Err(e) = self.send(RelayMessage::BdtRun) {
            return BdtReply::Failed(e.to_string());
        }
        // The edge reads nothing while recording; BDT_END sent earlier
        // could land in the same read as BDT_RUN.
        pause(self.settings.run_delay);
        if let Err(e) = self.send(RelayMessage::BdtEnd) {
            return BdtReply::Failed(e.to_string());
        }
        let deadline = Instant::now() + self.settings.bdt_timeout;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.recv_within(left) {
                Some(text) if text == RelayMessage::BdtEnd.as_str() => {
                    info!("Edge finished BDT run");
                    return BdtReply::Done(time_stamp());
                }
                Some(text) => debug!(reply = %text, "Ignoring reply while waiting for BDT_END"),
                None => break,
            }
        }
        BdtReply::Failed("edge did not acknowledge BDT_END".into())
    }

    /// Pull the rendered block from the edge chunk by chunk.
    #[instrument(skip(self))]
    pub fn fetch_bdt(&mut self, caller: &str) -> BdtReply {
        if self.locks.any_held() {
            return BdtReply::Rejected(BDT_BUSY);
        }
        self.locks.bdt = Some(caller.to_string());
        let reply = self.try_fetch_bdt();
        self.locks.bdt = None;
        reply
    }

    fn try_fetch_bdt(&mut self) -> BdtReply {
        let mut text = String::new();
        let mut chunks = 0usize;
        loop {
            if let Err(e) = self.send(RelayMessage::BdtReq) {
                return BdtReply::Failed(e.to_string());
            }
            let Some(chunk) = self.recv_within(self.settings.bdt_timeout) else {
                return BdtReply::Failed(format!("no reply after {} chunks", chunks));
            };
            chunks += 1;
            text.push_str(&chunk);
            if chunk.contains("End of Data") {
                break;
            }
        }
        let capture = Capture::parse(&text);
        info!(
            chunks,
            bytes = text.len(),
            rows = capture.rows.len(),
            "Block fetched"
        );
        self.capture = Some(capture);
        BdtReply::Done(time_stamp())
    }

    /// Tell the edge to close its device session.
    #[instrument(skip(self))]
    pub fn close_device(&mut self) -> Result<(), RelayError> {
        self.send(RelayMessage::DevClose)?;
        self.monitoring = false;
        self.locks = LockTable::default();
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        Ok(())
    }
}

/// `2020-12-10 10:00:00 (1607594400.123)`
fn time_stamp() -> String {
    let now = Local::now();
    format!(
        "{} ({:.3})",
        now.format("%Y-%m-%d %H:%M:%S"),
        now.timestamp_millis() as f64 / 1000.0
    )
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}
