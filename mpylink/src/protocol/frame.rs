//! Board command protocol: frame encoding and decoding.
//!
//! ## Frame Format
//!
//! ```text
//! +----------+--------+------+---------------+--------+----------+
//! |  Header  | Length | Code |     Data      | CRC16  |  Footer  |
//! +----------+--------+------+---------------+--------+----------+
//! | 3 bytes  | 1 byte | 1    |   variable    | 2 (BE) | 3 bytes  |
//! +----------+--------+------+---------------+--------+----------+
//! | AA AB AA | len(P) |<------ payload P ---->| CRC(P) | AB CC AB |
//! +----------+--------+------+---------------+--------+----------+
//! ```
//!
//! Requests carry the command code as the first payload byte. Responses carry
//! a status byte there instead (0 = success).
//!
//! The length byte holds `len(P) mod 256`. Payloads of 256 bytes and more
//! (a full write chunk plus its file name) are delimited by searching the
//! candidate lengths `L, L + 256, ...` for the footer.

use crate::error::{Error, Result};
use crate::protocol::crc::crc16;
use byteorder::{BigEndian, WriteBytesExt};
use std::fmt;
use std::time::Duration;

/// Frame start marker.
pub const FRAME_HEADER: [u8; 3] = [0xAA, 0xAB, 0xAA];

/// Frame end marker.
pub const FRAME_FOOTER: [u8; 3] = [0xAB, 0xCC, 0xAB];

/// Header + length byte + CRC + footer.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER.len() + 1 + 2 + FRAME_FOOTER.len();

/// Largest payload (code/status byte included) the codec accepts.
pub const MAX_PAYLOAD_LEN: usize = 1024;

/// Response text that signals a completed device-side operation.
pub const COMPLETION_MARKER: &str = "done";

/// Board command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum CommandCode {
    /// Liveness check.
    IsOnline = 0x00,
    /// Firmware/board information.
    GetInfo = 0x01,
    /// Execute source code.
    Exec = 0x02,
    /// List a directory.
    ListDir = 0x03,
    /// Legacy bulk download, not used by the host.
    Download = 0x04,
    /// Read a whole file.
    GetFile = 0x05,
    /// Write one chunk of a file.
    DownloadFile = 0x06,
    /// Delete a file.
    RemoveFile = 0x07,
    /// Store network credentials.
    SetWifi = 0x08,
}

impl CommandCode {
    /// Short operation name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::IsOnline => "is-online",
            Self::GetInfo => "get-info",
            Self::Exec => "exec",
            Self::ListDir => "list-dir",
            Self::Download => "download",
            Self::GetFile => "get-file",
            Self::DownloadFile => "write-chunk",
            Self::RemoveFile => "remove-file",
            Self::SetWifi => "set-wifi",
        }
    }

    /// Timeout override for slow commands; `None` uses the connection default.
    pub fn default_timeout(self) -> Option<Duration> {
        match self {
            Self::Exec => Some(Duration::from_secs(30)),
            Self::DownloadFile | Self::GetFile => Some(Duration::from_secs(10)),
            Self::SetWifi => Some(Duration::from_secs(15)),
            _ => None,
        }
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x00 => Self::IsOnline,
            0x01 => Self::GetInfo,
            0x02 => Self::Exec,
            0x03 => Self::ListDir,
            0x04 => Self::Download,
            0x05 => Self::GetFile,
            0x06 => Self::DownloadFile,
            0x07 => Self::RemoveFile,
            0x08 => Self::SetWifi,
            other => return Err(Error::Protocol(format!("unknown command code 0x{other:02X}"))),
        })
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Status byte carried by response frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResponseStatus {
    /// Operation succeeded.
    Success,
    /// Generic device-side failure.
    Error,
    /// Device-side timeout.
    Timeout,
    /// Device busy.
    Busy,
    /// Target does not exist.
    NotFound,
    /// Target not writable/readable.
    PermissionDenied,
}

impl ResponseStatus {
    /// Map a status byte. Unknown values are reported as [`ResponseStatus::Error`].
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Self::Success,
            2 => Self::Timeout,
            3 => Self::Busy,
            4 => Self::NotFound,
            5 => Self::PermissionDenied,
            _ => Self::Error,
        }
    }

    /// Wire value of this status.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Error => 1,
            Self::Timeout => 2,
            Self::Busy => 3,
            Self::NotFound => 4,
            Self::PermissionDenied => 5,
        }
    }

    /// Check if this is a success status.
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Busy => "busy",
            Self::NotFound => "not-found",
            Self::PermissionDenied => "permission-denied",
        };
        f.write_str(s)
    }
}

/// Flag byte of a chunked file write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriteMode {
    /// Append to the existing file.
    Append = 0x00,
    /// Truncate the file, then write.
    Overwrite = 0x01,
}

/// Command frame builder.
#[derive(Debug, Clone)]
pub struct CommandFrame {
    code: CommandCode,
    data: Vec<u8>,
}

impl CommandFrame {
    /// Create a frame with no data.
    pub fn new(code: CommandCode) -> Self {
        Self {
            code,
            data: Vec::new(),
        }
    }

    /// Create a frame carrying `data`.
    pub fn with_data(code: CommandCode, data: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            data: data.into(),
        }
    }

    /// Build an execute-code frame.
    pub fn exec(source: &str) -> Self {
        Self::with_data(CommandCode::Exec, source.as_bytes())
    }

    /// Build a list-directory frame.
    pub fn list_dir(path: &str) -> Self {
        Self::with_data(CommandCode::ListDir, path.as_bytes())
    }

    /// Build a read-file frame.
    pub fn get_file(path: &str) -> Self {
        Self::with_data(CommandCode::GetFile, path.as_bytes())
    }

    /// Build a delete-file frame.
    pub fn remove_file(path: &str) -> Self {
        Self::with_data(CommandCode::RemoveFile, path.as_bytes())
    }

    /// Build a chunked file write frame.
    ///
    /// Data layout: `filename` + `0x00` + flag + chunk bytes.
    pub fn write_chunk(filename: &str, mode: WriteMode, chunk: &[u8]) -> Self {
        let mut data = Vec::with_capacity(filename.len() + 2 + chunk.len());
        data.extend_from_slice(filename.as_bytes());
        data.push(0x00);
        data.push(mode as u8);
        data.extend_from_slice(chunk);
        Self::with_data(CommandCode::DownloadFile, data)
    }

    /// Build a set-wifi frame (`ssid` + `0x00` + `password`).
    pub fn set_wifi(ssid: &str, password: &str) -> Self {
        let mut data = Vec::with_capacity(ssid.len() + 1 + password.len());
        data.extend_from_slice(ssid.as_bytes());
        data.push(0x00);
        data.extend_from_slice(password.as_bytes());
        Self::with_data(CommandCode::SetWifi, data)
    }

    /// Build the complete frame bytes.
    pub fn build(&self) -> Result<Vec<u8>> {
        encode_frame(self.code as u8, &self.data)
    }

    /// Get the command code.
    pub fn code(&self) -> CommandCode {
        self.code
    }

    /// Get the command data (payload without the code byte).
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Encode `lead` (command code or status byte) and `data` into a frame.
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn encode_frame(lead: u8, data: &[u8]) -> Result<Vec<u8>> {
    let payload_len = 1 + data.len();
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::FrameTooLarge {
            len: payload_len,
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut buf = Vec::with_capacity(FRAME_OVERHEAD + payload_len);
    buf.extend_from_slice(&FRAME_HEADER);
    // Exact for payloads below 256 bytes
    buf.push((payload_len & 0xFF) as u8);

    let payload_start = buf.len();
    buf.push(lead);
    buf.extend_from_slice(data);

    let crc = crc16(&buf[payload_start..]);
    buf.write_u16::<BigEndian>(crc).unwrap();
    buf.extend_from_slice(&FRAME_FOOTER);

    Ok(buf)
}

/// A CRC-validated frame as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    payload: Vec<u8>,
}

impl RawFrame {
    /// First payload byte (command code or status).
    pub fn lead(&self) -> u8 {
        self.payload[0]
    }

    /// Payload after the lead byte.
    pub fn data(&self) -> &[u8] {
        &self.payload[1..]
    }

    /// Full payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Outcome of scanning a buffer for one frame.
enum Scan {
    Frame(RawFrame, usize),
    /// More bytes could still complete a frame. Carries the first
    /// footer-delimited candidate whose CRC did not match, if any.
    Incomplete(Option<Error>),
    Failed(Error),
}

fn scan_frame(buf: &[u8]) -> Scan {
    let Some(start) = buf
        .windows(FRAME_HEADER.len())
        .position(|w| w == FRAME_HEADER)
    else {
        return Scan::Incomplete(None);
    };

    let frame = &buf[start..];
    if frame.len() < FRAME_OVERHEAD + 1 {
        return Scan::Incomplete(None);
    }

    let declared = usize::from(frame[FRAME_HEADER.len()]);
    let mut payload_len = if declared == 0 { 256 } else { declared };
    let payload_start = FRAME_HEADER.len() + 1;
    let mut mismatch = None;

    while payload_len <= MAX_PAYLOAD_LEN {
        let total = FRAME_OVERHEAD + payload_len;
        if frame.len() < total {
            return Scan::Incomplete(mismatch);
        }

        let crc_at = payload_start + payload_len;
        if frame[crc_at + 2..total] == FRAME_FOOTER {
            let payload = &frame[payload_start..crc_at];
            let expected = u16::from_be_bytes([frame[crc_at], frame[crc_at + 1]]);
            let actual = crc16(payload);
            if expected == actual {
                return Scan::Frame(
                    RawFrame {
                        payload: payload.to_vec(),
                    },
                    start + total,
                );
            }
            // Footer bytes inside a longer payload look the same as a bad CRC
            mismatch.get_or_insert(Error::CrcMismatch { expected, actual });
        }

        payload_len += 256;
    }

    Scan::Failed(mismatch.unwrap_or_else(|| {
        Error::Protocol(format!(
            "no frame footer found for length byte {declared} within {MAX_PAYLOAD_LEN} payload bytes"
        ))
    }))
}

/// Decode the first frame in `buf`.
///
/// Bytes before the first header are skipped. Returns `Ok(None)` while the
/// frame is incomplete, and on success the frame together with the number of
/// bytes consumed from `buf` (skipped prefix included).
///
/// A footer whose CRC does not match is not final while a longer candidate
/// length could still arrive: the payload may itself contain footer bytes.
/// Use [`stalled_frame_error`] once the line has gone quiet.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(RawFrame, usize)>> {
    match scan_frame(buf) {
        Scan::Frame(raw, consumed) => Ok(Some((raw, consumed))),
        Scan::Incomplete(_) => Ok(None),
        Scan::Failed(e) => Err(e),
    }
}

/// Error for a buffer that will not receive more bytes.
///
/// Returns the CRC mismatch of the first footer-delimited candidate when
/// [`decode_frame`] is still waiting for a longer one, and `None` when there
/// is nothing to report yet.
pub fn stalled_frame_error(buf: &[u8]) -> Option<Error> {
    match scan_frame(buf) {
        Scan::Incomplete(mismatch) => mismatch,
        Scan::Frame(..) => None,
        Scan::Failed(e) => Some(e),
    }
}

/// Parsed response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Status reported by the device.
    pub status: ResponseStatus,
    /// Response data.
    pub data: Vec<u8>,
}

impl ResponseFrame {
    /// Interpret a raw frame as a response.
    ///
    /// A non-zero status byte becomes [`Error::DeviceStatus`], which still
    /// carries the status and the remaining data.
    pub fn from_raw(raw: &RawFrame) -> Result<Self> {
        let status = ResponseStatus::from_byte(raw.lead());
        if !status.is_success() {
            return Err(Error::DeviceStatus {
                status,
                data: raw.data().to_vec(),
            });
        }
        Ok(Self {
            status,
            data: raw.data().to_vec(),
        })
    }

    /// Build the wire bytes for a response (used by device simulators).
    pub fn encode(status: ResponseStatus, data: &[u8]) -> Result<Vec<u8>> {
        encode_frame(status.as_byte(), data)
    }
}

/// Decode the first response frame in `buf`.
pub fn decode_response(buf: &[u8]) -> Result<Option<(ResponseFrame, usize)>> {
    match decode_frame(buf)? {
        Some((raw, consumed)) => Ok(Some((ResponseFrame::from_raw(&raw)?, consumed))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let data = CommandFrame::exec("1+1").build().unwrap();
        assert_eq!(&data[0..3], &FRAME_HEADER);
        assert_eq!(data[3], 4); // code + "1+1"
        assert_eq!(data[4], CommandCode::Exec as u8);
        assert_eq!(&data[5..8], b"1+1");
        let crc = crc16(&data[4..8]);
        assert_eq!(&data[8..10], &crc.to_be_bytes());
        assert_eq!(&data[10..], &FRAME_FOOTER);
        assert_eq!(data.len(), FRAME_OVERHEAD + 4);
    }

    #[test]
    fn test_encode_empty_command() {
        let data = CommandFrame::new(CommandCode::IsOnline).build().unwrap();
        assert_eq!(data.len(), FRAME_OVERHEAD + 1);
        assert_eq!(data[3], 1);
        assert_eq!(data[4], 0x00);
    }

    #[test]
    fn test_round_trip_all_codes() {
        for code in 0u8..=8 {
            let code = CommandCode::try_from(code).unwrap();
            for len in [0usize, 1, 17, 200, 254] {
                let payload: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
                let bytes = CommandFrame::with_data(code, payload.clone())
                    .build()
                    .unwrap();
                let (frame, consumed) = decode_frame(&bytes).unwrap().unwrap();
                assert_eq!(consumed, bytes.len());
                assert_eq!(frame.lead(), code as u8);
                assert_eq!(frame.data(), payload.as_slice());
            }
        }
    }

    #[test]
    fn test_decode_large_payload() {
        // 256-byte chunk plus file name header does not fit the length byte
        let chunk = vec![0x5A; 256];
        let bytes = CommandFrame::write_chunk("/flash/main.py", WriteMode::Append, &chunk)
            .build()
            .unwrap();
        let (frame, consumed) = decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(frame.lead(), CommandCode::DownloadFile as u8);
        assert!(frame.data().ends_with(&chunk));
    }

    #[test]
    fn test_decode_incomplete() {
        let bytes = CommandFrame::exec("print(1)").build().unwrap();
        assert!(decode_frame(&bytes[..5]).unwrap().is_none());
        assert!(decode_frame(&bytes[..bytes.len() - 1]).unwrap().is_none());
        assert!(decode_frame(&[]).unwrap().is_none());
        assert!(decode_frame(&[0x00; 32]).unwrap().is_none());
    }

    #[test]
    fn test_decode_skips_garbage_prefix() {
        let mut buf = vec![0x00, 0xFF, 0xAA];
        let bytes = ResponseFrame::encode(ResponseStatus::Success, b"done").unwrap();
        buf.extend_from_slice(&bytes);
        let (resp, consumed) = decode_response(&buf).unwrap().unwrap();
        assert_eq!(resp.data, b"done");
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_decode_crc_mismatch() {
        let mut bytes = ResponseFrame::encode(ResponseStatus::Success, b"done").unwrap();
        let crc_at = bytes.len() - FRAME_FOOTER.len() - 2;
        bytes[crc_at] ^= 0xFF;
        // A longer candidate could still follow
        assert!(decode_frame(&bytes).unwrap().is_none());
        assert!(matches!(
            stalled_frame_error(&bytes),
            Some(Error::CrcMismatch { .. })
        ));

        // Once every candidate length is covered the mismatch is final
        bytes.resize(FRAME_OVERHEAD + MAX_PAYLOAD_LEN + 16, 0);
        let err = decode_frame(&bytes).unwrap_err();
        assert!(matches!(err, Error::CrcMismatch { .. }));
    }

    #[test]
    fn test_decode_corrupted_payload() {
        let mut bytes = ResponseFrame::encode(ResponseStatus::Success, b"boot.py").unwrap();
        bytes[6] ^= 0x20;
        assert!(decode_response(&bytes).unwrap().is_none());
        assert!(matches!(
            stalled_frame_error(&bytes),
            Some(Error::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_footer_bytes_inside_long_payload() {
        // 300 data bytes: length byte wraps to 45, and the footer pattern sits
        // exactly where the 45-byte candidate expects it
        let mut data: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        data[46..49].copy_from_slice(&FRAME_FOOTER);
        let bytes = ResponseFrame::encode(ResponseStatus::Success, &data).unwrap();
        assert_eq!(bytes[3], 45);
        assert_eq!(&bytes[FRAME_HEADER.len() + 1 + 45 + 2..][..3], &FRAME_FOOTER);

        let (resp, consumed) = decode_response(&bytes).unwrap().unwrap();
        assert_eq!(resp.data, data);
        assert_eq!(consumed, bytes.len());
        assert!(stalled_frame_error(&bytes).is_none());

        // While only the short candidate has arrived, keep waiting
        let short = &bytes[..FRAME_OVERHEAD + 45];
        assert!(decode_response(short).unwrap().is_none());
    }

    #[test]
    fn test_stalled_frame_error_quiet_on_incomplete() {
        let bytes = CommandFrame::exec("print(1)").build().unwrap();
        assert!(stalled_frame_error(&bytes[..bytes.len() - 1]).is_none());
        assert!(stalled_frame_error(&[]).is_none());
    }

    #[test]
    fn test_non_zero_status_keeps_data() {
        let bytes = ResponseFrame::encode(ResponseStatus::NotFound, b"ENOENT").unwrap();
        match decode_response(&bytes) {
            Err(Error::DeviceStatus { status, data }) => {
                assert_eq!(status, ResponseStatus::NotFound);
                assert_eq!(data, b"ENOENT");
            },
            other => panic!("expected device status error, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_too_large() {
        let data = vec![0u8; MAX_PAYLOAD_LEN];
        assert!(matches!(
            encode_frame(CommandCode::Exec as u8, &data),
            Err(Error::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_write_chunk_layout() {
        let frame = CommandFrame::write_chunk("a.py", WriteMode::Overwrite, b"xyz");
        assert_eq!(frame.code(), CommandCode::DownloadFile);
        assert_eq!(frame.data(), b"a.py\x00\x01xyz");
    }

    #[test]
    fn test_set_wifi_layout() {
        let frame = CommandFrame::set_wifi("home", "secret");
        assert_eq!(frame.data(), b"home\x00secret");
    }

    #[test]
    fn test_status_mapping() {
        for status in [
            ResponseStatus::Success,
            ResponseStatus::Error,
            ResponseStatus::Timeout,
            ResponseStatus::Busy,
            ResponseStatus::NotFound,
            ResponseStatus::PermissionDenied,
        ] {
            assert_eq!(ResponseStatus::from_byte(status.as_byte()), status);
        }
        assert_eq!(ResponseStatus::from_byte(0x7F), ResponseStatus::Error);
    }

    #[test]
    fn test_command_code_try_from() {
        assert_eq!(CommandCode::try_from(0x06).unwrap(), CommandCode::DownloadFile);
        assert!(CommandCode::try_from(0x09).is_err());
    }
}
