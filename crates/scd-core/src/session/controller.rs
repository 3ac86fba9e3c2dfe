//! Session controller: drives the sensor experiment lifecycle.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result as AnyResult;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::device::{DeviceInfo, first_byte};
use super::state::{SessionError, SessionState};
use crate::bdt::{END_OF_DATA, PacketOutcome, Reassembler, TextBlock, encode};
use crate::config::{ScdConfig, TimingConfig};
use crate::events::{LogLevel, SessionEvent, SessionObserver, TracingObserver};
use crate::protocol::constants::*;
use crate::protocol::{BulkPacket, ModeConfig, RollingSample};
use crate::retry::{RetryError, retry};
use crate::transport::{SensorTransport, TransportError};

/// Progress events are emitted every this many packets.
const PROGRESS_EVERY: usize = 256;

/// Parameters of the controller, resolved from [`ScdConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Mode config template; time stamp and flash mode are filled in per run.
    pub base: ModeConfig,
    /// Recording time of one bulk transfer run.
    pub run_time: Duration,
    /// Radio idle time before a keep-alive cycle.
    pub idle_interval: Duration,
    pub timing: TimingConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            base: ModeConfig::default(),
            run_time: Duration::from_secs(3),
            idle_interval: Duration::from_secs(60),
            timing: TimingConfig::default(),
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &ScdConfig) -> AnyResult<Self> {
        Ok(Self {
            base: config.experiment.mode_config()?,
            run_time: config.experiment.run_time(),
            idle_interval: config.experiment.idle_interval(),
            timing: config.timing.clone(),
        })
    }

    /// No recording time and no device delays.
    pub fn immediate() -> Self {
        Self {
            run_time: Duration::ZERO,
            timing: TimingConfig::immediate(),
            ..Self::default()
        }
    }
}

/// Statistics of the current or last STE run.
#[derive(Debug, Clone, Default)]
pub struct SteStats {
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub notifications: u64,
    pub last_sample: Option<RollingSample>,
}

impl SteStats {
    fn start(&mut self) {
        *self = Self {
            started_at: Some(Utc::now()),
            ..Self::default()
        };
    }

    fn stop(&mut self) {
        self.stopped_at = Some(Utc::now());
        let secs = match (self.started_at, self.stopped_at) {
            (Some(a), Some(b)) => (b - a).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };
        info!(
            notifications = self.notifications,
            duration = %format!("{:.3}s", secs),
            "STE run finished"
        );
    }
}

/// Owns the transport and everything that belongs to one device session.
pub struct SessionController<T: SensorTransport, O: SessionObserver> {
    transport: T,
    observer: Arc<O>,
    settings: SessionSettings,
    state: SessionState,
    mode_config: Option<ModeConfig>,
    stats: SteStats,
    reassembler: Reassembler,
    block: Option<TextBlock>,
    device: Option<DeviceInfo>,
    last_radio: Instant,
}

impl<T: SensorTransport> SessionController<T, TracingObserver> {
    /// Create a controller with the default tracing observer.
    pub fn new(transport: T, settings: SessionSettings) -> Self {
        Self::with_observer(transport, settings, Arc::new(TracingObserver))
    }
}

impl<T: SensorTransport, O: SessionObserver> SessionController<T, O> {
    /// Create a controller with a custom observer.
    pub fn with_observer(transport: T, settings: SessionSettings, observer: Arc<O>) -> Self {
        Self {
            transport,
            observer,
            settings,
            state: SessionState::Idle,
            mode_config: None,
            stats: SteStats::default(),
            reassembler: Reassembler::new(),
            block: None,
            device: None,
            last_radio: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SteStats {
        &self.stats
    }

    pub fn mode_config(&self) -> Option<&ModeConfig> {
        self.mode_config.as_ref()
    }

    pub fn block(&self) -> Option<&TextBlock> {
        self.block.as_ref()
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn observer(&self) -> &Arc<O> {
        &self.observer
    }

    // ------------------------------------------------------------------
    // Radio helpers
    // ------------------------------------------------------------------

    fn write(&mut self, handle: u16, data: &[u8]) -> Result<(), TransportError> {
        self.last_radio = Instant::now();
        self.transport.write_characteristic(handle, data)
    }

    fn read(&mut self, handle: u16) -> Result<Vec<u8>, TransportError> {
        self.last_radio = Instant::now();
        self.transport.read_characteristic(handle)
    }

    fn command(&mut self, command: u8) -> Result<(), TransportError> {
        debug!(command = %format!("0x{:02X}", command), "Generic command");
        self.write(GEN_CMD_HND, &[command])
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from != to {
            self.state = to;
            self.observer
                .on_event(&SessionEvent::StateChanged { from, to });
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    /// Establish the radio link.
    #[instrument(skip(self), fields(address = %self.transport.address()))]
    pub fn connect(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.transport.connect()?;
        self.last_radio = Instant::now();
        self.observer.on_event(&SessionEvent::DeviceConnected {
            address: self.transport.address().to_string(),
        });
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), SessionError> {
        let policy = self.settings.timing.reconnect_policy();
        let transport = &mut self.transport;
        retry(&policy, |attempt| match transport.connect() {
            Ok(()) => Ok(Some(())),
            Err(e) => {
                warn!(attempt, error = %e, "Reconnect failed");
                Ok::<_, TransportError>(None)
            }
        })?;
        self.last_radio = Instant::now();
        self.observer.on_event(&SessionEvent::DeviceConnected {
            address: self.transport.address().to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Write the mode config and verify it by reading it back.
    fn write_config(&mut self, config: &ModeConfig) -> Result<(), SessionError> {
        self.write(STE_CONFIG_HND, &config.to_bytes())?;
        pause(self.settings.timing.config_readback());
        let raw = self.read(STE_CONFIG_HND)?;
        let read_back = ModeConfig::from_bytes(&raw)?;
        if !config.matches_written(&read_back) {
            warn!(written = ?config, read = ?read_back, "Mode config mismatch");
            return Err(SessionError::ConfigMismatch);
        }
        debug!(
            timestamp = config.timestamp,
            flash = config.writes_flash(),
            odr = config.accel_odr.hz(),
            "Mode config written"
        );
        self.mode_config = Some(*config);
        Ok(())
    }

    fn read_flash_free(&mut self) -> Result<u32, SessionError> {
        let raw = self.read(STE_CONFIG_HND)?;
        Ok(ModeConfig::from_bytes(&raw)?.flash_free)
    }

    // ------------------------------------------------------------------
    // STE lifecycle
    // ------------------------------------------------------------------

    /// Start a Short Time Experiment.
    ///
    /// `persist` selects Recording (samples written to flash) over Monitoring.
    #[instrument(skip(self))]
    pub fn start_experiment(
        &mut self,
        persist: bool,
        want_notify: bool,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.state != SessionState::Idle {
            return Err(SessionError::AlreadyRunning(self.state));
        }
        if let Err(e) = self.try_start(persist, want_notify) {
            warn!(error = %e, "STE start failed");
            self.transition(SessionState::Idle);
            return Err(e);
        }
        self.stats.start();
        self.transition(if persist {
            SessionState::Recording
        } else {
            SessionState::Monitoring
        });
        Ok(())
    }

    fn try_start(&mut self, persist: bool, want_notify: bool) -> Result<(), SessionError> {
        let config = self.settings.base.for_run(unix_now(), persist);
        self.write_config(&config)?;
        if want_notify {
            self.write(STE_RESULT_CCCD, &CCCD_NOTIFY.to_le_bytes())?;
            pause(self.settings.timing.settle());
        }
        self.write(SET_MODE_HND, &[MODE_STE])?;
        self.command(CMD_TOGGLE_STE)?;
        Ok(())
    }

    /// Stop the running experiment. A no-op unless one is running.
    #[instrument(skip(self))]
    pub fn stop_experiment(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !self.state.is_experiment() {
            debug!(state = %self.state, "No experiment to stop");
            return Ok(());
        }
        let result = self.halt_experiment();
        self.stats.stop();
        self.transition(SessionState::Idle);
        result
    }

    /// Toggle the experiment off and wait for the device to acknowledge.
    fn halt_experiment(&mut self) -> Result<(), SessionError> {
        self.command(CMD_TOGGLE_STE)?;
        self.wait_command_done(CMD_TOGGLE_STE)?;
        self.write(SET_MODE_HND, &[MODE_STE])?;
        Ok(())
    }

    fn wait_command_done(&mut self, command: u8) -> Result<(), SessionError> {
        let policy = self.settings.timing.stop_policy();
        let result = retry(&policy, |_| {
            let value = first_byte(self.read(GEN_CMD_HND)?);
            Ok::<_, TransportError>((value == CMD_IDLE).then_some(()))
        });
        match result {
            Ok(()) => Ok(()),
            Err(RetryError::Exhausted { .. }) => Err(SessionError::CommandTimeout { command }),
            Err(RetryError::Aborted(e)) => Err(e.into()),
        }
    }

    /// Whether an experiment is currently running on the device.
    ///
    /// Reads the STE result twice and compares the rolling counter.
    #[instrument(skip(self))]
    pub fn check_rolling(&mut self) -> Result<bool, SessionError> {
        let first = RollingSample::from_bytes(&self.read(STE_RESULT_HND)?)?;
        pause(self.settings.timing.rolling_check());
        let second = RollingSample::from_bytes(&self.read(STE_RESULT_HND)?)?;
        let rolling = first.rolling_counter != second.rolling_counter;
        debug!(
            first = first.rolling_counter,
            second = second.rolling_counter,
            rolling,
            "Rolling counter check"
        );
        Ok(rolling)
    }

    /// Keep an idle radio link alive with a zero-length start/stop cycle.
    ///
    /// Leaves state, events and statistics untouched. Returns whether a
    /// cycle was issued.
    pub fn idle_keep_alive(&mut self, now: Instant) -> Result<bool, SessionError> {
        if self.state != SessionState::Idle
            || now.saturating_duration_since(self.last_radio) < self.settings.idle_interval
        {
            return Ok(false);
        }
        debug!("Idle keep-alive cycle");
        self.write(SET_MODE_HND, &[MODE_STE])?;
        self.command(CMD_TOGGLE_STE)?;
        self.halt_experiment()?;
        Ok(true)
    }

    /// Read the latest STE result.
    pub fn read_sample(&mut self) -> Result<RollingSample, SessionError> {
        self.ensure_open()?;
        let sample = RollingSample::from_bytes(&self.read(STE_RESULT_HND)?)?;
        self.stats.last_sample = Some(sample);
        Ok(sample)
    }

    // ------------------------------------------------------------------
    // Bulk data transfer
    // ------------------------------------------------------------------

    /// Record for the configured run time, then pull the flash block and
    /// render it. Returns the size of the rendered text.
    #[instrument(skip(self))]
    pub fn run_bulk_transfer(&mut self) -> Result<usize, SessionError> {
        self.ensure_open()?;
        if self.state != SessionState::Idle {
            return Err(SessionError::AlreadyRunning(self.state));
        }
        self.block = None;
        self.start_experiment(true, true)?;
        if let Err(e) = self.pump_samples(self.settings.run_time) {
            self.stats.stop();
            self.transition(SessionState::Idle);
            return Err(e);
        }
        self.stop_experiment()?;

        self.transition(SessionState::BulkTransferring);
        match self.pull_block() {
            Ok(len) => Ok(len),
            Err(e) => {
                warn!(error = %e, "Bulk transfer failed");
                self.transition(SessionState::Idle);
                Err(e)
            }
        }
    }

    /// Consume STE notifications for `duration`.
    fn pump_samples(&mut self, duration: Duration) -> Result<(), SessionError> {
        let deadline = Instant::now() + duration;
        let poll = self.settings.timing.notify_poll();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let wait = poll.min(deadline - now);
            if let Some(n) = self.transport.wait_for_notification(wait)?
                && n.handle == STE_RESULT_HND
            {
                self.last_radio = Instant::now();
                match RollingSample::from_bytes(&n.data) {
                    Ok(sample) => {
                        self.stats.notifications += 1;
                        self.stats.last_sample = Some(sample);
                    }
                    Err(e) => warn!(error = %e, "Bad STE notification"),
                }
            }
        }
    }

    fn pull_block(&mut self) -> Result<usize, SessionError> {
        self.reassembler.reset();
        self.write(BDT_DATA_FLOW_CCCD, &CCCD_NOTIFY.to_le_bytes())?;
        self.write(BDT_CONTROL_HND, &[BDT_START])?;
        info!("BDT started");

        let wait = self.settings.timing.bdt_wait();
        let max_idle = self.settings.timing.stop_poll_attempts.max(1);
        let mut idle = 0u32;
        let mut since_progress = 0usize;
        loop {
            match self.transport.wait_for_notification(wait)? {
                Some(n) if n.handle == BDT_DATA_FLOW_HND => {
                    idle = 0;
                    self.last_radio = Instant::now();
                    let packet = match BulkPacket::from_bytes(&n.data) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, "Malformed BDT packet");
                            continue;
                        }
                    };
                    if let PacketOutcome::Header { total } = self.reassembler.accept(&packet) {
                        info!(total, "BDT block size");
                    }
                    since_progress += 1;
                    if since_progress >= PROGRESS_EVERY {
                        since_progress = 0;
                        self.observer.on_event(&SessionEvent::BdtProgress {
                            received: self.reassembler.received(),
                            total: self.reassembler.total().unwrap_or_default(),
                        });
                    }
                    if self.reassembler.all_received() {
                        break;
                    }
                }
                Some(other) => {
                    debug!(handle = other.handle, "Notification ignored during BDT");
                }
                None => {
                    let status = first_byte(self.read(BDT_STATUS_HND)?);
                    if status != BDT_STATUS_RUNNING {
                        debug!(status, "BDT no longer running");
                        break;
                    }
                    idle += 1;
                    if idle >= max_idle {
                        warn!(idle, "BDT stalled, using what was received");
                        break;
                    }
                }
            }
        }

        let total = self.reassembler.total().ok_or(SessionError::EmptyTransfer)?;
        let end = match self.reassembler.find_end_of_data() {
            Some(end) => end,
            None => {
                warn!(total, "End marker not found, using announced size");
                (total.saturating_sub(1) as usize) * BULK_PAYLOAD_SIZE
            }
        };
        let text = encode(self.reassembler.buffer(), end)?;
        let len = text.len();
        info!(
            packets = self.reassembler.received(),
            total,
            crc = ?self.reassembler.crc().map(|c| format!("0x{:08X}", c)),
            text_bytes = len,
            "BDT block reassembled"
        );
        self.observer.on_event(&SessionEvent::BdtComplete {
            bytes: len,
            throughput: self.reassembler.throughput(),
        });
        self.block = Some(TextBlock::new(text));
        self.clear_memory()?;
        Ok(len)
    }

    /// Next chunk of the rendered block, at most `max` bytes.
    ///
    /// Serving the end of the block returns the session to Idle.
    pub fn next_chunk(&mut self, max: usize) -> Result<String, SessionError> {
        self.ensure_open()?;
        let Some(block) = self.block.as_mut() else {
            return Ok(END_OF_DATA.to_string());
        };
        let chunk = block.get_chunk(max);
        let done = chunk == END_OF_DATA || block.is_exhausted();
        if done && self.state == SessionState::BulkTransferring {
            self.transition(SessionState::Idle);
        }
        Ok(chunk)
    }

    // ------------------------------------------------------------------
    // Device housekeeping
    // ------------------------------------------------------------------

    /// Bring a freshly connected device into a known idle state.
    #[instrument(skip(self))]
    pub fn prepare_device(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.device = Some(DeviceInfo::read(&mut self.transport)?);
        if self.check_rolling()? {
            warn!("Experiment left running on the device, stopping it");
            self.halt_experiment()?;
        }
        self.write(SET_MODE_HND, &[MODE_STE])?;
        self.clear_memory()?;
        let config = self.settings.base.for_run(unix_now(), false);
        self.write_config(&config)?;
        self.transition(SessionState::Idle);
        self.observer.on_event(&SessionEvent::Log {
            level: LogLevel::Info,
            message: "Device ready".into(),
        });
        Ok(())
    }

    /// Erase recorded data if the device reports flash in use.
    ///
    /// The device drops the link while erasing, so this reconnects.
    /// Returns whether an erase was issued.
    #[instrument(skip(self))]
    pub fn clear_memory(&mut self) -> Result<bool, SessionError> {
        let free = self.read_flash_free()?;
        if free as usize >= MAX_FLASH {
            debug!(free, "Flash empty");
            return Ok(false);
        }
        info!(used = MAX_FLASH - free as usize, "Erasing device flash");
        self.command(CMD_ERASE_FLASH)?;
        self.transport.disconnect()?;
        self.observer.on_event(&SessionEvent::DeviceDisconnected);
        pause(self.settings.timing.erase_wait());
        self.reconnect()?;
        Ok(true)
    }

    /// Stop everything, clean the device and close the link. Terminal.
    #[instrument(skip(self))]
    pub fn shutdown(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let result = self.cleanup();
        if let Err(e) = self.transport.disconnect() {
            warn!(error = %e, "Disconnect failed");
        }
        self.observer.on_event(&SessionEvent::DeviceDisconnected);
        self.block = None;
        self.transition(SessionState::Closed);
        result
    }

    fn cleanup(&mut self) -> Result<(), SessionError> {
        if !self.transport.is_connected() {
            return Ok(());
        }
        self.stop_experiment()?;
        self.command(CMD_RESET_THRESHOLD)?;
        self.clear_memory()?;
        Ok(())
    }

    /// Tear the radio link down and bring the device back to Idle.
    #[instrument(skip(self))]
    pub fn recover(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        warn!(state = %self.state, "Recovering radio link");
        if let Err(e) = self.transport.disconnect() {
            debug!(error = %e, "Disconnect during recovery failed");
        }
        self.observer.on_event(&SessionEvent::DeviceDisconnected);
        if self.state.is_experiment() {
            self.stats.stop();
        }
        self.block = None;
        self.transition(SessionState::Idle);
        self.reconnect()?;
        self.prepare_device()
    }
}

fn unix_now() -> i32 {
    Utc::now().timestamp() as i32
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingObserver;
    use crate::transport::{MockTransport, SimulatedSensor};

    fn mock_controller() -> (
        SessionController<MockTransport, RecordingObserver>,
        MockTransport,
        Arc<RecordingObserver>,
    ) {
        let mock = MockTransport::new();
        // Device echoes the written config and reports empty flash.
        let mut empty = ModeConfig::default().to_bytes();
        empty[31..35].copy_from_slice(&(MAX_FLASH as u32).to_le_bytes());
        mock.set_value(STE_CONFIG_HND, &empty);
        mock.set_value(BDT_STATUS_HND, &[BDT_STATUS_DONE]);
        let observer = Arc::new(RecordingObserver::default());
        let controller = SessionController::with_observer(
            mock.clone(),
            SessionSettings::immediate(),
            observer.clone(),
        );
        (controller, mock, observer)
    }

    fn sim_controller(
        sensor: SimulatedSensor,
    ) -> SessionController<SimulatedSensor, RecordingObserver> {
        let mut c = SessionController::with_observer(
            sensor.with_notify_interval(Duration::ZERO),
            SessionSettings::immediate(),
            Arc::new(RecordingObserver::default()),
        );
        c.connect().unwrap();
        c
    }

    /// Queue a config read-back that differs from any real run config.
    fn echo_config(mock: &MockTransport, persist: bool) {
        let mut bytes = ModeConfig::default().for_run(0, persist).to_bytes();
        bytes[31..35].copy_from_slice(&(MAX_FLASH as u32).to_le_bytes());
        mock.queue_read(STE_CONFIG_HND, &bytes);
    }

    #[test]
    fn test_start_then_stop_writes_expected_commands() {
        let (mut c, mock, observer) = mock_controller();
        // The mock stores writes as register values, so a read after the
        // config write returns the written bytes.
        mock.queue_read(GEN_CMD_HND, &[CMD_TOGGLE_STE]);
        mock.queue_read(GEN_CMD_HND, &[CMD_IDLE]);

        c.start_experiment(false, true).unwrap();
        assert_eq!(c.state(), SessionState::Monitoring);
        assert!(!c.mode_config().unwrap().writes_flash());

        let handles: Vec<u16> = mock.get_writes().iter().map(|(h, _)| *h).collect();
        assert_eq!(
            handles,
            vec![STE_CONFIG_HND, STE_RESULT_CCCD, SET_MODE_HND, GEN_CMD_HND]
        );
        assert_eq!(mock.writes_to(STE_RESULT_CCCD), vec![vec![0x01, 0x00]]);

        mock.clear_writes();
        c.stop_experiment().unwrap();
        assert_eq!(c.state(), SessionState::Idle);
        assert_eq!(
            mock.get_writes(),
            vec![(GEN_CMD_HND, vec![CMD_TOGGLE_STE]), (SET_MODE_HND, vec![MODE_STE])]
        );
        assert_eq!(
            observer.transitions(),
            vec![
                (SessionState::Idle, SessionState::Monitoring),
                (SessionState::Monitoring, SessionState::Idle)
            ]
        );
    }

    #[test]
    fn test_start_while_running_is_rejected() {
        let (mut c, _mock, _) = mock_controller();
        c.start_experiment(true, false).unwrap();
        assert_eq!(c.state(), SessionState::Recording);
        assert!(matches!(
            c.start_experiment(false, false),
            Err(SessionError::AlreadyRunning(SessionState::Recording))
        ));
    }

    #[test]
    fn test_stop_from_idle_is_noop() {
        let (mut c, mock, observer) = mock_controller();
        c.stop_experiment().unwrap();
        assert!(mock.get_writes().is_empty());
        assert!(observer.transitions().is_empty());
        assert_eq!(c.state(), SessionState::Idle);
    }

    #[test]
    fn test_transport_error_on_start_reverts_to_idle() {
        let (mut c, mock, _) = mock_controller();
        mock.fail_writes_to(SET_MODE_HND);
        let err = c.start_experiment(false, false).unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert_eq!(c.state(), SessionState::Idle);
    }

    #[test]
    fn test_stop_times_out_and_reverts() {
        let (mut c, mock, _) = mock_controller();
        c.start_experiment(false, false).unwrap();
        // Generic command register keeps reporting the toggle.
        let err = c.stop_experiment().unwrap_err();
        assert!(matches!(
            err,
            SessionError::CommandTimeout {
                command: CMD_TOGGLE_STE
            }
        ));
        assert_eq!(c.state(), SessionState::Idle);
        assert_eq!(mock.writes_to(GEN_CMD_HND).len(), 2);
    }

    #[test]
    fn test_config_mismatch() {
        let (mut c, mock, _) = mock_controller();
        echo_config(&mock, true);
        let err = c.start_experiment(false, false).unwrap_err();
        assert!(matches!(err, SessionError::ConfigMismatch));
        assert_eq!(c.state(), SessionState::Idle);
    }

    #[test]
    fn test_check_rolling() {
        let (mut c, mock, _) = mock_controller();
        let a = RollingSample {
            rolling_counter: 4,
            ..RollingSample::default()
        };
        let b = RollingSample {
            rolling_counter: 5,
            ..a
        };
        mock.queue_read(STE_RESULT_HND, &a.to_bytes());
        mock.queue_read(STE_RESULT_HND, &a.to_bytes());
        assert!(!c.check_rolling().unwrap());

        mock.queue_read(STE_RESULT_HND, &a.to_bytes());
        mock.queue_read(STE_RESULT_HND, &b.to_bytes());
        assert!(c.check_rolling().unwrap());
    }

    #[test]
    fn test_idle_keep_alive_is_silent() {
        let (mut c, mock, observer) = mock_controller();
        mock.queue_read(GEN_CMD_HND, &[CMD_IDLE]);
        assert!(!c.idle_keep_alive(Instant::now()).unwrap());

        let later = Instant::now() + Duration::from_secs(61);
        assert!(c.idle_keep_alive(later).unwrap());
        assert_eq!(mock.writes_to(GEN_CMD_HND).len(), 2);
        assert_eq!(c.state(), SessionState::Idle);
        assert!(observer.events().is_empty());
        assert_eq!(c.stats().notifications, 0);
    }

    #[test]
    fn test_next_chunk_without_block() {
        let (mut c, _mock, _) = mock_controller();
        assert_eq!(c.next_chunk(64).unwrap(), END_OF_DATA);
    }

    #[test]
    fn test_bulk_transfer_from_scripted_packets() {
        let (mut c, mock, observer) = mock_controller();
        let mut block = vec![0x55u8; 4];
        let mut container = [0u8; 13];
        container[9] = 1;
        block.extend_from_slice(&container);
        block.extend_from_slice(&[0x01, 0x00, 0x00, 0x30, 0x00]);
        for s in [1i16, 2, 3] {
            block.extend_from_slice(&s.to_le_bytes());
        }
        block.extend_from_slice(&[0x00, 0x00, 0xAA, 0xAA, 0xAA, 0xAA]);
        block.resize(48, 0xFF);
        // header + 3 data + footer
        let mut header = [0u8; 16];
        header[..4].copy_from_slice(&5u32.to_le_bytes());
        let mut packets = vec![BulkPacket::new(0, header)];
        for (i, chunk) in block.chunks(16).enumerate() {
            packets.push(BulkPacket::new(i as u32 + 1, chunk.try_into().unwrap()));
        }
        packets.push(BulkPacket::new(4, [0x77; 16]));
        for idx in [2, 0, 4, 1, 3] {
            mock.queue_notification(BDT_DATA_FLOW_HND, &packets[idx].to_bytes());
        }
        mock.queue_read(GEN_CMD_HND, &[CMD_IDLE]);

        let len = c.run_bulk_transfer().unwrap();
        assert_eq!(c.state(), SessionState::BulkTransferring);
        let text = c.block().unwrap().text().to_string();
        assert_eq!(text.len(), len);
        assert!(text.contains("accelometer ODR: 800 Hz\n"));
        assert!(text.contains("     1,      0.000,      1,      2,      3\n"));

        let chunk = c.next_chunk(1024).unwrap();
        assert_eq!(chunk, text);
        assert_eq!(c.state(), SessionState::Idle);
        assert_eq!(c.next_chunk(1024).unwrap(), END_OF_DATA);
        assert!(
            observer
                .events()
                .iter()
                .any(|e| matches!(e, SessionEvent::BdtComplete { .. }))
        );
    }

    #[test]
    fn test_bulk_transfer_refused_when_not_idle() {
        let (mut c, _mock, _) = mock_controller();
        c.start_experiment(false, false).unwrap();
        assert!(matches!(
            c.run_bulk_transfer(),
            Err(SessionError::AlreadyRunning(SessionState::Monitoring))
        ));
    }

    #[test]
    fn test_bulk_transfer_without_header_fails_to_idle() {
        let (mut c, mock, _) = mock_controller();
        mock.queue_read(GEN_CMD_HND, &[CMD_IDLE]);
        assert!(matches!(
            c.run_bulk_transfer(),
            Err(SessionError::EmptyTransfer)
        ));
        assert_eq!(c.state(), SessionState::Idle);
    }

    #[test]
    fn test_shutdown_is_terminal_from_every_state() {
        for start in [
            SessionState::Idle,
            SessionState::Monitoring,
            SessionState::Recording,
            SessionState::BulkTransferring,
        ] {
            let (mut c, mock, _) = mock_controller();
            mock.queue_read(GEN_CMD_HND, &[CMD_IDLE]);
            c.state = start;
            c.shutdown().unwrap();
            assert_eq!(c.state(), SessionState::Closed, "from {start}");
            assert!(!mock.is_connected());
            assert!(matches!(
                c.start_experiment(false, false),
                Err(SessionError::Closed)
            ));
            assert!(matches!(c.next_chunk(64), Err(SessionError::Closed)));
        }
    }

    #[test]
    fn test_simulated_record_and_transfer() {
        let mut c = sim_controller(SimulatedSensor::new("sim"));
        c.settings.run_time = Duration::from_millis(20);
        c.prepare_device().unwrap();
        assert!(c.device_info().is_some());

        let len = c.run_bulk_transfer().unwrap();
        assert!(len > 0);
        let mut joined = String::new();
        loop {
            let chunk = c.next_chunk(256).unwrap();
            if chunk == END_OF_DATA {
                break;
            }
            assert!(chunk.len() <= 256);
            joined.push_str(&chunk);
        }
        assert_eq!(joined, c.block().unwrap().text());
        assert!(joined.starts_with("server time    : "));
        assert!(joined.ends_with(END_OF_DATA));
        assert_eq!(c.state(), SessionState::Idle);
        // flash was erased after the transfer
        assert_eq!(c.transport().flash_free() as usize, MAX_FLASH);
    }

    #[test]
    fn test_prepare_stops_leftover_experiment() {
        let mut c = sim_controller(
            SimulatedSensor::new("sim")
                .with_experiment_running()
                .with_stale_recording(3),
        );
        c.prepare_device().unwrap();
        assert!(!c.transport().is_running());
        assert_eq!(c.transport().flash_free() as usize, MAX_FLASH);
        assert_eq!(c.state(), SessionState::Idle);
    }

    #[test]
    fn test_recover_after_link_drop() {
        let mut c = sim_controller(SimulatedSensor::new("sim"));
        c.prepare_device().unwrap();
        c.start_experiment(false, true).unwrap();
        c.transport.drop_link();
        assert!(c.read_sample().is_err());

        c.recover().unwrap();
        assert_eq!(c.state(), SessionState::Idle);
        assert!(c.transport().is_connected());
        assert!(!c.transport().is_running());
    }
}
