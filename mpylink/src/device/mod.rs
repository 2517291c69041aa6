//! High-level board operations.
//!
//! [`DeviceManager`] maps domain operations onto single channel calls (or a
//! chunked transfer for writes) and parses the responses into typed results.

use crate::channel::{CancelToken, Command, CommandResponse};
use crate::connection::Connection;
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::frame::{COMPLETION_MARKER, CommandCode, CommandFrame};
use crate::transfer::{FileTransferEngine, TransferProgress, TransferReport, UploadOptions};
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Longest SSID accepted by the board, in bytes.
pub const MAX_SSID_LEN: usize = 32;

/// Longest network password accepted by the board, in bytes.
pub const MAX_WIFI_PASSWORD_LEN: usize = 64;

/// Check network credentials before they are sent.
///
/// The SSID is 1 to [`MAX_SSID_LEN`] bytes, the password at most
/// [`MAX_WIFI_PASSWORD_LEN`]. Neither may contain NUL, which separates them
/// on the wire.
pub fn validate_wifi_credentials(ssid: &str, password: &str) -> Result<()> {
    if ssid.is_empty() || ssid.len() > MAX_SSID_LEN {
        return Err(Error::Validation(format!(
            "SSID must be 1 to {MAX_SSID_LEN} bytes, got {}",
            ssid.len()
        )));
    }
    if password.len() > MAX_WIFI_PASSWORD_LEN {
        return Err(Error::Validation(format!(
            "password must be at most {MAX_WIFI_PASSWORD_LEN} bytes"
        )));
    }
    if ssid.contains('\0') || password.contains('\0') {
        return Err(Error::Validation(
            "SSID and password must not contain NUL".into(),
        ));
    }
    Ok(())
}

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

/// One directory listing entry.
///
/// The board only reports names. Names containing a `.` are taken to be
/// files and everything else a directory, so a dotted directory name is
/// reported as a file.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DirEntry {
    /// Entry name.
    pub name: String,
    /// Guessed kind.
    pub kind: EntryKind,
}

impl DirEntry {
    /// Classify `name`.
    pub fn from_name(name: &str) -> Self {
        let kind = if name.contains('.') {
            EntryKind::File
        } else {
            EntryKind::Directory
        };
        Self {
            name: name.to_string(),
            kind,
        }
    }

    /// Whether this entry is a file.
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Parse a comma-separated listing.
pub fn parse_listing(text: &str) -> Vec<DirEntry> {
    text.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(DirEntry::from_name)
        .collect()
}

/// Board information as reported by the firmware.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceInfo {
    /// Response text as received.
    pub raw: String,
    /// `key=value` / `key: value` pairs found in the text.
    pub fields: BTreeMap<String, String>,
}

impl DeviceInfo {
    /// Parse the info response. Pieces without a separator are kept only in `raw`.
    pub fn parse(text: &str) -> Self {
        let fields = text
            .split(['\n', ','])
            .filter_map(|piece| {
                let (key, value) = piece
                    .split_once('=')
                    .or_else(|| piece.split_once(':'))?;
                let key = key.trim();
                (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
            })
            .collect();
        Self {
            raw: text.to_string(),
            fields,
        }
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(String::as_str)
    }
}

/// Outcome of running code on the board.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ExecutionResult {
    /// Program output, completion marker removed.
    pub output: String,
    /// 0 when the completion marker was present, 1 otherwise.
    pub exit_code: i32,
    /// Wall-clock time from dispatch to response.
    pub duration: Duration,
}

impl ExecutionResult {
    fn from_response(resp: &CommandResponse) -> Self {
        let text = resp.text();
        let (output, exit_code) = match text.rfind(COMPLETION_MARKER) {
            Some(at) => {
                let mut output = text[..at].to_string();
                output.push_str(&text[at + COMPLETION_MARKER.len()..]);
                (output.trim_end().to_string(), 0)
            },
            None => (text, 1),
        };
        Self {
            output,
            exit_code,
            duration: resp.duration(),
        }
    }

    /// Whether the run completed.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Board operations over one [`Connection`].
pub struct DeviceManager {
    connection: Arc<Connection>,
    cancel: Option<CancelToken>,
}

impl DeviceManager {
    /// Create a manager for `connection`.
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            cancel: None,
        }
    }

    /// Attach `token` to every command this manager sends.
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    fn send(&self, frame: CommandFrame) -> Result<CommandResponse> {
        let cmd = Command::from(frame).with_cancel(self.cancel.clone());
        self.connection
            .channel()
            .send_command(&cmd)
    }

    fn send_expect_done(&self, frame: CommandFrame) -> Result<()> {
        let operation = frame.code().name();
        let resp = self.send(frame)?;
        if resp.is_completion() {
            Ok(())
        } else {
            Err(Error::UnexpectedResponse {
                operation,
                response: resp.text(),
            })
        }
    }

    fn engine(&self) -> FileTransferEngine<'_> {
        self.connection
            .transfer_engine()
            .with_cancel(self.cancel.clone())
    }

    /// Ping the board. Any failure reads as offline.
    pub fn is_online(&self) -> bool {
        match self.send(CommandFrame::new(CommandCode::IsOnline)) {
            Ok(_) => true,
            Err(e) => {
                debug!("Online check failed: {e}");
                false
            },
        }
    }

    /// Query firmware and board information.
    pub fn device_info(&self) -> Result<DeviceInfo> {
        let resp = self.send(CommandFrame::new(CommandCode::GetInfo))?;
        Ok(DeviceInfo::parse(&resp.text()))
    }

    /// List `path`.
    pub fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let resp = self.send(CommandFrame::list_dir(path))?;
        Ok(parse_listing(&resp.text()))
    }

    /// Read a whole file.
    ///
    /// Device and protocol failures are reported as [`Error::FileNotFound`].
    /// Busy, timeout, cancellation and transport errors pass through.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        match self.send(CommandFrame::get_file(path)) {
            Ok(resp) => Ok(resp.data),
            Err(e) if e.kind() == ErrorKind::Protocol => Err(Error::FileNotFound {
                path: path.to_string(),
                reason: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Read a file as text (lossy UTF-8).
    pub fn read_file_text(&self, path: &str) -> Result<String> {
        let data = self.read_file(path)?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Create or replace `path` with `content`.
    pub fn write_file<F>(
        &self,
        path: &str,
        content: &[u8],
        options: &UploadOptions,
        progress: F,
    ) -> Result<TransferReport>
    where
        F: FnMut(&TransferProgress),
    {
        let report = self
            .engine()
            .upload_file(path, content, true, options, progress)?;
        info!("Wrote {path} ({} bytes)", report.bytes);
        Ok(report)
    }

    /// Append `content` to `path`.
    ///
    /// Only content that fits in a single chunk is appended; longer content
    /// replaces the file, since the first of several chunks always truncates.
    pub fn append_file<F>(
        &self,
        path: &str,
        content: &[u8],
        options: &UploadOptions,
        progress: F,
    ) -> Result<TransferReport>
    where
        F: FnMut(&TransferProgress),
    {
        self.engine()
            .upload_file(path, content, false, options, progress)
    }

    /// Delete a file.
    pub fn delete_file(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(Error::Validation("path is empty".into()));
        }
        self.send_expect_done(CommandFrame::remove_file(path))
    }

    /// Run source code on the board.
    pub fn execute_code(&self, code: &str) -> Result<ExecutionResult> {
        let resp = self.send(CommandFrame::exec(code))?;
        let result = ExecutionResult::from_response(&resp);
        debug!(
            "Execution finished with exit code {} in {:?}",
            result.exit_code, result.duration
        );
        Ok(result)
    }

    /// Read `path` from the board and run it.
    pub fn execute_file(&self, path: &str) -> Result<ExecutionResult> {
        let source = self.read_file_text(path)?;
        self.execute_code(&source)
    }

    /// Run the `main.py` of the project in `dir`.
    pub fn execute_project(&self, dir: &str) -> Result<ExecutionResult> {
        let dir = dir.trim_end_matches('/');
        let entry = if dir.is_empty() {
            "main.py".to_string()
        } else {
            format!("{dir}/main.py")
        };
        self.execute_file(&entry)
    }

    /// Store network credentials.
    pub fn set_wifi_config(&self, ssid: &str, password: &str) -> Result<()> {
        validate_wifi_credentials(ssid, password)?;
        self.send_expect_done(CommandFrame::set_wifi(ssid, password))
    }
}
