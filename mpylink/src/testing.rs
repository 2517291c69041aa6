//! Test doubles for the protocol engine.

use crate::error::{Error, Result};
use crate::port::Transport;
use crate::protocol::frame::{CommandCode, ResponseFrame, ResponseStatus, decode_frame};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub(crate) fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
}

/// What the simulated board does with a request.
pub(crate) enum Reply {
    /// Send these bytes right away.
    Bytes(Vec<u8>),
    /// Send these bytes after a delay.
    Delayed(Vec<u8>, Duration),
    /// Never answer.
    Silence,
}

impl Reply {
    pub(crate) fn ok(data: &[u8]) -> Self {
        Self::status(ResponseStatus::Success, data)
    }

    pub(crate) fn status(status: ResponseStatus, data: &[u8]) -> Self {
        Self::Bytes(ResponseFrame::encode(status, data).unwrap())
    }

    pub(crate) fn delayed(data: &[u8], delay: Duration) -> Self {
        Self::Delayed(
            ResponseFrame::encode(ResponseStatus::Success, data).unwrap(),
            delay,
        )
    }

    /// A success frame whose CRC does not match.
    pub(crate) fn corrupted(data: &[u8]) -> Self {
        let mut bytes = ResponseFrame::encode(ResponseStatus::Success, data).unwrap();
        let crc_at = bytes.len() - 5;
        bytes[crc_at] ^= 0xFF;
        Self::Bytes(bytes)
    }
}

type Responder = Box<dyn FnMut(CommandCode, &[u8]) -> Reply + Send>;

struct MockState {
    open: bool,
    writes: usize,
    requests: Vec<(u8, Vec<u8>)>,
    inbound: VecDeque<(Instant, u8)>,
    responder: Responder,
    fail_writes: usize,
    read_limit: usize,
}

/// Scripted board on the far end of a [`Transport`].
///
/// Clones share state, so a test keeps one handle for inspection while the
/// channel owns another.
#[derive(Clone)]
pub(crate) struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: FnMut(CommandCode, &[u8]) -> Reply + Send + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(MockState {
                open: false,
                writes: 0,
                requests: Vec::new(),
                inbound: VecDeque::new(),
                responder: Box::new(responder),
                fail_writes: 0,
                read_limit: usize::MAX,
            })),
        }
    }

    /// Hand out at most `limit` bytes per read.
    pub(crate) fn with_read_limit(self, limit: usize) -> Self {
        self.state
            .lock()
            .unwrap()
            .read_limit = limit.max(1);
        self
    }

    /// Fail the next `n` writes with a communication error.
    pub(crate) fn fail_next_writes(&self, n: usize) {
        self.state
            .lock()
            .unwrap()
            .fail_writes = n;
    }

    /// Successful frame writes so far.
    pub(crate) fn write_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .writes
    }

    /// Decoded requests as `(code byte, data)`.
    pub(crate) fn requests(&self) -> Vec<(u8, Vec<u8>)> {
        self.state
            .lock()
            .unwrap()
            .requests
            .clone()
    }

    /// Open handle, boxed for a channel.
    pub(crate) fn boxed(&self) -> Box<dyn Transport> {
        let mut transport = self.clone();
        transport.open().unwrap();
        Box::new(transport)
    }
}

impl Transport for MockDevice {
    fn open(&mut self) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .open
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(Error::NotConnected);
        }
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(Error::Communication("write failed: injected".into()));
        }
        state.writes += 1;

        let Some((frame, _)) = decode_frame(data)? else {
            return Ok(());
        };
        state
            .requests
            .push((frame.lead(), frame.data().to_vec()));

        let code = CommandCode::try_from(frame.lead())?;
        let reply = (state.responder)(code, frame.data());
        let now = Instant::now();
        let (bytes, at) = match reply {
            Reply::Bytes(bytes) => (bytes, now),
            Reply::Delayed(bytes, delay) => (bytes, now + delay),
            Reply::Silence => return Ok(()),
        };
        state
            .inbound
            .extend(bytes.into_iter().map(|b| (at, b)));
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8], wait: Duration) -> Result<usize> {
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                let limit = buf.len().min(state.read_limit);
                let mut n = 0;
                while n < limit {
                    match state.inbound.front() {
                        Some(&(at, byte)) if at <= now => {
                            buf[n] = byte;
                            n += 1;
                            state.inbound.pop_front();
                        },
                        _ => break,
                    }
                }
                if n > 0 {
                    return Ok(n);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            thread::sleep((deadline - now).min(Duration::from_millis(1)));
        }
    }

    fn discard_input(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state
            .inbound
            .retain(|&(at, _)| at > now);
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// In-memory board file system answering the file commands.
#[derive(Clone, Default)]
pub(crate) struct BoardFiles {
    pub(crate) files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl BoardFiles {
    pub(crate) fn with_file(self, name: &str, content: &[u8]) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), content.to_vec());
        self
    }

    pub(crate) fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(name)
            .cloned()
    }

    /// Answer one request like the board firmware does.
    pub(crate) fn handle(&self, code: CommandCode, data: &[u8]) -> Reply {
        let mut files = self.files.lock().unwrap();
        match code {
            CommandCode::IsOnline => Reply::ok(b"done"),
            CommandCode::GetInfo => Reply::ok(b"firmware=1.2.0\nboard=mpy-s3\nfree_mem=81920"),
            CommandCode::ListDir => {
                let names: Vec<&str> = files
                    .keys()
                    .map(String::as_str)
                    .collect();
                Reply::ok(names.join(",").as_bytes())
            },
            CommandCode::GetFile => {
                let name = String::from_utf8_lossy(data);
                match files.get(name.as_ref()) {
                    Some(content) => Reply::ok(content),
                    None => Reply::status(ResponseStatus::NotFound, b"ENOENT"),
                }
            },
            CommandCode::RemoveFile => {
                let name = String::from_utf8_lossy(data);
                match files.remove(name.as_ref()) {
                    Some(_) => Reply::ok(b"done"),
                    None => Reply::status(ResponseStatus::NotFound, b"ENOENT"),
                }
            },
            CommandCode::DownloadFile => {
                let Some(nul) = data.iter().position(|&b| b == 0) else {
                    return Reply::status(ResponseStatus::Error, b"malformed");
                };
                let name = String::from_utf8_lossy(&data[..nul]).into_owned();
                let flag = data[nul + 1];
                let chunk = &data[nul + 2..];
                let entry = files.entry(name).or_default();
                if flag == 1 {
                    entry.clear();
                }
                entry.extend_from_slice(chunk);
                Reply::ok(b"done")
            },
            CommandCode::Exec => {
                let source = String::from_utf8_lossy(data);
                if source.contains("raise") {
                    Reply::ok(b"Traceback (most recent call last):\nValueError")
                } else if let Some(text) = source
                    .strip_prefix("print('")
                    .and_then(|s| s.strip_suffix("')"))
                {
                    Reply::ok(format!("{text}\ndone").as_bytes())
                } else {
                    Reply::ok(b"done")
                }
            },
            CommandCode::SetWifi => Reply::ok(b"done"),
            CommandCode::Download => Reply::status(ResponseStatus::Error, b"unsupported"),
        }
    }

    /// Mock device backed by this file system.
    pub(crate) fn device(&self) -> MockDevice {
        let files = self.clone();
        MockDevice::new(move |code, data| files.handle(code, data))
    }
}
