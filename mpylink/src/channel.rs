//! Single-flight command channel.
//!
//! A [`CommandChannel`] owns one [`Transport`] and allows exactly one command
//! to be outstanding at a time. A second caller is turned away with
//! [`Error::DeviceBusy`] instead of being queued.
//!
//! ## States
//!
//! ```text
//! Idle -> Sending -> AwaitingResponse -> Completed | TimedOut | Failed -> Idle
//! ```
//!
//! Every terminal state falls back to `Idle` before `send_command` returns.
//! Bytes that belong to an expired or cancelled command are dropped from the
//! transport before the next command is written.

use crate::connection::events::{ConnectionEvent, EventBus};
use crate::error::{Error, Result};
use crate::port::Transport;
use crate::protocol::frame::{
    COMPLETION_MARKER, CommandCode, CommandFrame, ResponseStatus, decode_response,
    stalled_frame_error,
};
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Response budget when neither the command, the connection, nor the
/// command code sets one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest single wait on the transport before re-checking deadline and cancellation.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Silence after a partial frame that ends the wait for more of it.
pub const FRAME_IDLE_GAP: Duration = Duration::from_millis(50);

/// Cancellation handle for the wait on a response.
///
/// Cancelling only ends the wait; bytes already written stay written.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A command to dispatch.
#[derive(Debug, Clone)]
pub struct Command {
    frame: CommandFrame,
    timeout: Option<Duration>,
    cancel: Option<CancelToken>,
}

impl Command {
    /// Create a command with no data.
    pub fn new(code: CommandCode) -> Self {
        CommandFrame::new(code).into()
    }

    /// Override the response timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, token: Option<CancelToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Get the command code.
    pub fn code(&self) -> CommandCode {
        self.frame.code()
    }

    /// Get the frame to send.
    pub fn frame(&self) -> &CommandFrame {
        &self.frame
    }

    /// Explicit timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancelToken::is_cancelled)
    }
}

impl From<CommandFrame> for Command {
    fn from(frame: CommandFrame) -> Self {
        Self {
            frame,
            timeout: None,
            cancel: None,
        }
    }
}

/// A resolved command.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    /// Command this response answers.
    pub code: CommandCode,
    /// Device status.
    pub status: ResponseStatus,
    /// Response data (status byte stripped).
    pub data: Vec<u8>,
    /// When the frame was handed to the transport.
    pub dispatched_at: Instant,
    /// When the response frame completed.
    pub resolved_at: Instant,
}

impl CommandResponse {
    /// Wall-clock time from dispatch to resolution.
    pub fn duration(&self) -> Duration {
        self.resolved_at
            .saturating_duration_since(self.dispatched_at)
    }

    /// Response data as text (lossy UTF-8).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Whether the data is exactly the completion marker.
    pub fn is_completion(&self) -> bool {
        self.data == COMPLETION_MARKER.as_bytes()
    }
}

/// Channel state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    /// Ready for a command.
    Idle,
    /// Frame being written.
    Sending,
    /// Frame written, waiting for the response.
    AwaitingResponse,
    /// Response received.
    Completed,
    /// Budget elapsed without a response.
    TimedOut,
    /// Write, decode or device failure.
    Failed,
}

/// Snapshot of a channel's connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    /// Transport open.
    pub open: bool,
    /// A command is pending.
    pub busy: bool,
    /// Current phase.
    pub phase: ChannelPhase,
    /// Command currently pending.
    pub pending: Option<CommandCode>,
}

#[derive(Debug)]
struct PendingCommand {
    code: CommandCode,
    dispatched_at: Instant,
}

#[derive(Debug)]
struct ChannelState {
    open: bool,
    phase: ChannelPhase,
    pending: Option<PendingCommand>,
}

/// Resets the channel to `Idle` when the in-flight command ends, however it ends.
struct InFlight<'a> {
    state: &'a Mutex<ChannelState>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = lock(self.state);
        state.phase = ChannelPhase::Idle;
        state.pending = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Single-flight command/response channel over one transport.
pub struct CommandChannel {
    name: String,
    transport: Mutex<Box<dyn Transport>>,
    state: Mutex<ChannelState>,
    command_timeout: Option<Duration>,
    poll_interval: Duration,
    events: Arc<EventBus>,
}

impl CommandChannel {
    /// Create a channel over `transport`.
    ///
    /// `command_timeout` applies to every command that carries no timeout of
    /// its own; `None` falls back to the per-code defaults.
    pub fn new(
        transport: Box<dyn Transport>,
        command_timeout: Option<Duration>,
        poll_interval: Duration,
        events: Arc<EventBus>,
    ) -> Self {
        let open = transport.is_open();
        Self {
            name: transport
                .name()
                .to_string(),
            transport: Mutex::new(transport),
            state: Mutex::new(ChannelState {
                open,
                phase: ChannelPhase::Idle,
                pending: None,
            }),
            command_timeout,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            events,
        }
    }

    /// Transport name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured response budget, if any.
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout
    }

    /// Response budget for `cmd`.
    ///
    /// The command's own timeout wins, then the configured one, then the
    /// code's default, then [`DEFAULT_COMMAND_TIMEOUT`].
    pub fn timeout_for(&self, cmd: &Command) -> Duration {
        cmd.timeout()
            .or(self.command_timeout)
            .or_else(|| cmd.code().default_timeout())
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT)
    }

    /// Open the transport.
    pub fn open(&self) -> Result<()> {
        self.ensure_idle()?;
        lock(&self.transport).open()?;
        lock(&self.state).open = true;
        Ok(())
    }

    /// Close the transport. Fails with [`Error::DeviceBusy`] while a command is pending.
    pub fn close(&self) -> Result<()> {
        self.ensure_idle()?;
        lock(&self.state).open = false;
        lock(&self.transport).close()
    }

    /// Whether the transport is open.
    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectionState {
        let state = lock(&self.state);
        ConnectionState {
            open: state.open,
            busy: state.pending.is_some(),
            phase: state.phase,
            pending: state
                .pending
                .as_ref()
                .map(|p| p.code),
        }
    }

    /// How long the pending command has been waiting, if any.
    pub fn pending_for(&self) -> Option<Duration> {
        lock(&self.state)
            .pending
            .as_ref()
            .map(|p| p.dispatched_at.elapsed())
    }

    /// Send `cmd` and wait for its response.
    ///
    /// Fails immediately with [`Error::DeviceBusy`] if another command is in
    /// flight; the transport is not touched in that case.
    pub fn send_command(&self, cmd: &Command) -> Result<CommandResponse> {
        let code = cmd.code();
        let timeout = self.timeout_for(cmd);

        let dispatched_at = Instant::now();
        let _in_flight = self.begin(code, dispatched_at)?;

        let result = self.exchange(cmd, timeout, dispatched_at);

        let phase = match &result {
            Ok(_) => ChannelPhase::Completed,
            Err(Error::Timeout { .. }) => ChannelPhase::TimedOut,
            Err(_) => ChannelPhase::Failed,
        };
        lock(&self.state).phase = phase;

        match &result {
            Ok(resp) => debug!(
                "{} resolved in {:?} ({} bytes)",
                code,
                resp.duration(),
                resp.data.len()
            ),
            Err(e) => {
                warn!("{code} failed: {e}");
                self.events
                    .emit(&ConnectionEvent::Error {
                        operation: code,
                        message: e.to_string(),
                    });
            },
        }

        result
    }

    /// Claim the channel for `code`.
    fn begin(&self, code: CommandCode, dispatched_at: Instant) -> Result<InFlight<'_>> {
        let mut state = lock(&self.state);
        if let Some(pending) = &state.pending {
            let pending = pending.code;
            drop(state);
            return Err(self.busy(code, pending));
        }
        if !state.open {
            return Err(Error::NotConnected);
        }
        state.phase = ChannelPhase::Sending;
        state.pending = Some(PendingCommand {
            code,
            dispatched_at,
        });
        Ok(InFlight { state: &self.state })
    }

    fn ensure_idle(&self) -> Result<()> {
        match lock(&self.state)
            .pending
            .as_ref()
        {
            Some(pending) => Err(Error::DeviceBusy {
                pending: pending.code,
            }),
            None => Ok(()),
        }
    }

    fn busy(&self, rejected: CommandCode, pending: CommandCode) -> Error {
        debug!("Rejecting {rejected}: {pending} still pending");
        self.events
            .emit(&ConnectionEvent::Busy { rejected, pending });
        Error::DeviceBusy { pending }
    }

    /// Write the frame and wait for the response frame.
    fn exchange(
        &self,
        cmd: &Command,
        timeout: Duration,
        dispatched_at: Instant,
    ) -> Result<CommandResponse> {
        let code = cmd.code();
        let bytes = cmd.frame().build()?;
        let deadline = dispatched_at + timeout;

        let mut transport = lock(&self.transport);
        if !transport.is_open() {
            return Err(Error::NotConnected);
        }

        // Whatever is buffered now answers an earlier, abandoned command
        transport.discard_input()?;

        trace!("Sending {code}: {} bytes", bytes.len());
        transport.write_raw(&bytes)?;
        transport.drain()?;
        lock(&self.state).phase = ChannelPhase::AwaitingResponse;

        let mut accumulator: Vec<u8> = Vec::with_capacity(64);
        let mut buf = [0u8; 256];
        let mut last_rx = Instant::now();

        loop {
            if cmd.is_cancelled() {
                return Err(Error::Cancelled(format!("{code} cancelled by caller")));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    operation: code.name(),
                    after: timeout,
                });
            }

            let wait = (deadline - now).min(self.poll_interval);
            let n = transport.read_available(&mut buf, wait)?;
            if n == 0 {
                if !accumulator.is_empty() && last_rx.elapsed() >= FRAME_IDLE_GAP {
                    if let Some(e) = stalled_frame_error(&accumulator) {
                        return Err(e);
                    }
                }
                continue;
            }
            accumulator.extend_from_slice(&buf[..n]);
            last_rx = Instant::now();

            if let Some((frame, _)) = decode_response(&accumulator)? {
                return Ok(CommandResponse {
                    code,
                    status: frame.status,
                    data: frame.data,
                    dispatched_at,
                    resolved_at: Instant::now(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDevice, Reply, init_logger};
    use std::thread;

    fn channel_for(device: &MockDevice, timeout: Duration) -> Arc<CommandChannel> {
        init_logger();
        let mut transport = device.clone();
        transport.open().unwrap();
        Arc::new(CommandChannel::new(
            Box::new(transport),
            Some(timeout),
            Duration::from_millis(2),
            Arc::new(EventBus::new()),
        ))
    }

    #[test]
    fn test_send_command_resolves() {
        let device = MockDevice::new(|_, _| Reply::ok(b"done"));
        let channel = channel_for(&device, Duration::from_millis(500));

        let resp = channel
            .send_command(&Command::new(CommandCode::IsOnline))
            .unwrap();
        assert_eq!(resp.status, ResponseStatus::Success);
        assert!(resp.is_completion());
        assert!(resp.resolved_at >= resp.dispatched_at);
        assert_eq!(channel.state().phase, ChannelPhase::Idle);
        assert!(!channel.state().busy);
        assert_eq!(device.requests().len(), 1);
        assert_eq!(device.requests()[0].0, CommandCode::IsOnline as u8);
    }

    #[test]
    fn test_response_split_across_reads() {
        let device = MockDevice::new(|_, _| Reply::ok(b"boot.py,main.py")).with_read_limit(3);
        let channel = channel_for(&device, Duration::from_millis(500));

        let resp = channel
            .send_command(&CommandFrame::list_dir("/").into())
            .unwrap();
        assert_eq!(resp.text(), "boot.py,main.py");
    }

    #[test]
    fn test_timeout_once_then_idle() {
        let device = MockDevice::new(|code, _| match code {
            CommandCode::Exec => Reply::Silence,
            _ => Reply::ok(b"done"),
        });
        let channel = channel_for(&device, Duration::from_millis(50));

        let err = channel
            .send_command(&Command::from(CommandFrame::exec("while True: pass")).with_timeout(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { operation: "exec", .. }));

        let state = channel.state();
        assert_eq!(state.phase, ChannelPhase::Idle);
        assert!(state.pending.is_none());

        // The channel accepts the next command
        assert!(channel.send_command(&Command::new(CommandCode::IsOnline)).is_ok());
    }

    #[test]
    fn test_busy_rejects_without_touching_transport() {
        let device = MockDevice::new(|code, _| match code {
            CommandCode::Exec => Reply::Silence,
            _ => Reply::ok(b"done"),
        });
        let channel = channel_for(&device, Duration::from_millis(300));

        let background = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.send_command(&CommandFrame::exec("sleep(10)").into()))
        };

        // Wait until the first command is on the wire
        let start = Instant::now();
        while device.write_count() == 0 && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(channel.state().busy);

        let err = channel
            .send_command(&Command::new(CommandCode::IsOnline))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DeviceBusy {
                pending: CommandCode::Exec
            }
        ));
        assert_eq!(device.write_count(), 1);

        let first = background.join().unwrap();
        assert!(matches!(first, Err(Error::Timeout { .. })));
        assert!(!channel.state().busy);
    }

    #[test]
    fn test_crc_failure_rejects_and_returns_to_idle() {
        let device = MockDevice::new(|_, _| Reply::corrupted(b"done"));
        let channel = channel_for(&device, Duration::from_millis(200));

        let err = channel
            .send_command(&Command::new(CommandCode::IsOnline))
            .unwrap_err();
        assert!(matches!(err, Error::CrcMismatch { .. }));
        assert_eq!(channel.state().phase, ChannelPhase::Idle);
    }

    #[test]
    fn test_long_response_with_footer_bytes_in_data() {
        let mut data = vec![b'x'; 300];
        data[46..49].copy_from_slice(&crate::protocol::frame::FRAME_FOOTER);
        let reply = data.clone();
        let device = MockDevice::new(move |_, _| Reply::ok(&reply)).with_read_limit(16);
        let channel = channel_for(&device, Duration::from_millis(500));

        let resp = channel
            .send_command(&CommandFrame::get_file("/flash/data.bin").into())
            .unwrap();
        assert_eq!(resp.data, data);
        assert_eq!(channel.state().phase, ChannelPhase::Idle);
    }

    #[test]
    fn test_device_status_rejects_with_data() {
        let device = MockDevice::new(|_, _| Reply::status(ResponseStatus::NotFound, b"ENOENT"));
        let channel = channel_for(&device, Duration::from_millis(200));

        match channel.send_command(&CommandFrame::get_file("/nope.py").into()) {
            Err(Error::DeviceStatus { status, data }) => {
                assert_eq!(status, ResponseStatus::NotFound);
                assert_eq!(data, b"ENOENT");
            },
            other => panic!("expected device status, got {other:?}"),
        }
        assert!(!channel.state().busy);
    }

    #[test]
    fn test_configured_timeout_beats_code_default() {
        let device = MockDevice::new(|_, _| Reply::Silence);
        let channel = channel_for(&device, Duration::from_millis(50));

        let start = Instant::now();
        let err = channel
            .send_command(&CommandFrame::exec("while True: pass").into())
            .unwrap_err();
        match err {
            Error::Timeout { operation, after } => {
                assert_eq!(operation, "exec");
                assert_eq!(after, Duration::from_millis(50));
            },
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_timeout_precedence() {
        let device = MockDevice::new(|_, _| Reply::Silence);
        let exec: Command = CommandFrame::exec("1").into();
        let ping = Command::new(CommandCode::IsOnline);

        let configured = channel_for(&device, Duration::from_millis(750));
        assert_eq!(configured.timeout_for(&exec), Duration::from_millis(750));
        assert_eq!(
            configured.timeout_for(&exec.clone().with_timeout(Duration::from_secs(2))),
            Duration::from_secs(2)
        );

        let unconfigured = CommandChannel::new(
            device.boxed(),
            None,
            DEFAULT_POLL_INTERVAL,
            Arc::new(EventBus::new()),
        );
        assert_eq!(unconfigured.timeout_for(&exec), Duration::from_secs(30));
        assert_eq!(unconfigured.timeout_for(&ping), DEFAULT_COMMAND_TIMEOUT);
    }

    #[test]
    fn test_late_response_is_discarded() {
        let calls = Arc::new(Mutex::new(0u32));
        let device = {
            let calls = Arc::clone(&calls);
            MockDevice::new(move |_, _| {
                let mut calls = calls.lock().unwrap();
                *calls += 1;
                if *calls == 1 {
                    Reply::delayed(b"stale", Duration::from_millis(60))
                } else {
                    Reply::ok(b"fresh")
                }
            })
        };
        let channel = channel_for(&device, Duration::from_millis(30));

        let first = channel.send_command(&Command::new(CommandCode::GetInfo));
        assert!(matches!(first, Err(Error::Timeout { .. })));

        // Let the late frame arrive before the next command
        thread::sleep(Duration::from_millis(80));

        let second = channel
            .send_command(&Command::new(CommandCode::GetInfo))
            .unwrap();
        assert_eq!(second.text(), "fresh");
    }

    #[test]
    fn test_cancel_ends_wait() {
        let device = MockDevice::new(|_, _| Reply::Silence);
        let channel = channel_for(&device, Duration::from_secs(5));
        let token = CancelToken::new();

        let canceller = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                token.cancel();
            })
        };

        let start = Instant::now();
        let err = channel
            .send_command(&Command::new(CommandCode::IsOnline).with_cancel(Some(token)))
            .unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, Error::Cancelled(_)));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!channel.state().busy);
    }

    #[test]
    fn test_write_failure_is_communication_error() {
        let device = MockDevice::new(|_, _| Reply::ok(b"done"));
        device.fail_next_writes(1);
        let channel = channel_for(&device, Duration::from_millis(200));

        let err = channel
            .send_command(&Command::new(CommandCode::IsOnline))
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(channel.send_command(&Command::new(CommandCode::IsOnline)).is_ok());
    }

    #[test]
    fn test_closed_channel_rejects() {
        let device = MockDevice::new(|_, _| Reply::ok(b"done"));
        let channel = channel_for(&device, Duration::from_millis(200));
        channel.close().unwrap();

        assert!(!channel.is_open());
        assert!(matches!(
            channel.send_command(&Command::new(CommandCode::IsOnline)),
            Err(Error::NotConnected)
        ));
        assert_eq!(device.write_count(), 0);
    }

    #[test]
    fn test_busy_emits_event() {
        let device = MockDevice::new(|_, _| Reply::Silence);
        init_logger();
        let mut transport = device.clone();
        transport.open().unwrap();
        let events = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            events.subscribe(move |event| seen.lock().unwrap().push(event.clone()));
        }
        let channel = Arc::new(CommandChannel::new(
            Box::new(transport),
            Some(Duration::from_millis(100)),
            Duration::from_millis(2),
            Arc::clone(&events),
        ));

        let background = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.send_command(&Command::new(CommandCode::GetInfo)))
        };
        let start = Instant::now();
        while device.write_count() == 0 && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(1));
        }
        let _ = channel.send_command(&Command::new(CommandCode::IsOnline));
        let _ = background.join().unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&ConnectionEvent::Busy {
            rejected: CommandCode::IsOnline,
            pending: CommandCode::GetInfo,
        }));
        assert!(seen.iter().any(|e| matches!(
            e,
            ConnectionEvent::Error {
                operation: CommandCode::GetInfo,
                ..
            }
        )));
    }
}
