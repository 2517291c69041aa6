//! Chunked file transfer to and from the board.
//!
//! Uploads are split into sequential write-chunk commands. The first chunk
//! truncates (or appends, for a single-chunk append), every later chunk
//! appends. Each chunk must be acknowledged with the completion marker before
//! the next one is sent; a failed chunk aborts the transfer and already
//! written chunks are left on the device.

use crate::channel::{CancelToken, Command, CommandChannel};
use crate::error::{Error, Result};
use crate::protocol::frame::{COMPLETION_MARKER, CommandFrame, MAX_PAYLOAD_LEN, WriteMode};
use crate::retry::RetryPolicy;
use log::{debug, info};
use std::time::{Duration, Instant};

/// Longest device file name accepted.
pub const MAX_FILENAME_LEN: usize = 28;

/// Chunk size for larger files.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Chunk size for small files.
pub const SMALL_CHUNK_SIZE: usize = 128;

/// Files below this size use [`SMALL_CHUNK_SIZE`].
pub const SMALL_FILE_THRESHOLD: usize = 512;

/// Largest chunk that fits a frame next to the longest file name.
pub const MAX_CHUNK_SIZE: usize = MAX_PAYLOAD_LEN - 1 - MAX_FILENAME_LEN - 2;

/// Check a device file name.
///
/// Names are 1 to [`MAX_FILENAME_LEN`] characters of ASCII letters, digits
/// and `_ - . /`.
pub fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("file name is empty".into()));
    }
    let len = name.chars().count();
    if len > MAX_FILENAME_LEN {
        return Err(Error::Validation(format!(
            "file name {name:?} is {len} characters (max {MAX_FILENAME_LEN})"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/')))
    {
        return Err(Error::Validation(format!(
            "file name {name:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

/// Chunk size used when the caller does not pick one.
pub fn select_chunk_size(total_len: usize) -> usize {
    if total_len < SMALL_FILE_THRESHOLD {
        SMALL_CHUNK_SIZE
    } else {
        DEFAULT_CHUNK_SIZE
    }
}

/// One planned write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Zero-based index.
    pub index: usize,
    /// Byte offset in the file.
    pub offset: usize,
    /// Chunk bytes.
    pub data: &'a [u8],
    /// Write flag sent with the chunk.
    pub mode: WriteMode,
}

/// Split `content` into chunks of at most `chunk_size` bytes.
///
/// Content that fits in one chunk is sent with the caller's flag. Longer
/// content always truncates with chunk 0 and appends the rest. Empty content
/// still produces one (empty) chunk so the file gets created or truncated.
pub fn plan_chunks(content: &[u8], chunk_size: usize, overwrite: bool) -> Vec<Chunk<'_>> {
    let first_mode = if overwrite {
        WriteMode::Overwrite
    } else {
        WriteMode::Append
    };

    if content.len() <= chunk_size {
        return vec![Chunk {
            index: 0,
            offset: 0,
            data: content,
            mode: first_mode,
        }];
    }

    content
        .chunks(chunk_size.max(1))
        .enumerate()
        .map(|(index, data)| Chunk {
            index,
            offset: index * chunk_size,
            data,
            mode: if index == 0 {
                WriteMode::Overwrite
            } else {
                WriteMode::Append
            },
        })
        .collect()
}

/// Upload tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    /// Fixed chunk size; `None` picks one from the file size.
    pub chunk_size: Option<usize>,
    /// Attempts per chunk.
    pub retry_attempts: u32,
    /// Read the file back and compare after the upload.
    pub verify: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            retry_attempts: crate::retry::DEFAULT_MAX_ATTEMPTS,
            verify: false,
        }
    }
}

/// Progress after each acknowledged chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    /// Device file name.
    pub filename: String,
    /// Bytes acknowledged so far.
    pub bytes_transferred: usize,
    /// Total bytes.
    pub total_bytes: usize,
    /// Index of the chunk just acknowledged.
    pub chunk_index: usize,
    /// Number of chunks.
    pub total_chunks: usize,
}

impl TransferProgress {
    /// Completion percentage, 0 to 100.
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        let pct = self.bytes_transferred * 100 / self.total_bytes;
        u8::try_from(pct.min(100)).unwrap_or(100)
    }
}

/// Summary of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TransferReport {
    /// Device file name.
    pub filename: String,
    /// Bytes written.
    pub bytes: usize,
    /// Chunks written.
    pub chunks: usize,
    /// Chunk size used.
    pub chunk_size: usize,
    /// Wall-clock duration.
    pub elapsed: Duration,
    /// Whether the read-back matched.
    pub verified: bool,
}

/// Drives chunked transfers over a [`CommandChannel`].
pub struct FileTransferEngine<'a> {
    channel: &'a CommandChannel,
    retry: RetryPolicy,
    cancel: Option<CancelToken>,
}

impl<'a> FileTransferEngine<'a> {
    /// Create an engine.
    pub fn new(channel: &'a CommandChannel, retry: RetryPolicy) -> Self {
        Self {
            channel,
            retry,
            cancel: None,
        }
    }

    /// Stop between chunks (and abort the current wait) when `token` fires.
    #[must_use]
    pub fn with_cancel(mut self, token: Option<CancelToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Upload `content` as `filename`.
    ///
    /// `progress` is called after every acknowledged chunk.
    pub fn upload_file<F>(
        &self,
        filename: &str,
        content: &[u8],
        overwrite: bool,
        options: &UploadOptions,
        mut progress: F,
    ) -> Result<TransferReport>
    where
        F: FnMut(&TransferProgress),
    {
        validate_filename(filename)?;

        let chunk_size = options
            .chunk_size
            .unwrap_or_else(|| select_chunk_size(content.len()));
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Validation(format!(
                "chunk size {chunk_size} out of range 1..={MAX_CHUNK_SIZE}"
            )));
        }

        let chunks = plan_chunks(content, chunk_size, overwrite);
        let total_chunks = chunks.len();
        let retry = self
            .retry
            .with_max_attempts(options.retry_attempts);
        let started = Instant::now();

        info!(
            "Uploading {filename}: {} bytes in {total_chunks} chunk(s) of {chunk_size}",
            content.len()
        );

        let mut sent = 0;
        for chunk in &chunks {
            let abort = |source: Error| Error::FileTransfer {
                filename: filename.to_string(),
                chunk_index: chunk.index,
                total_chunks,
                source: Box::new(source),
            };

            if self
                .cancel
                .as_ref()
                .is_some_and(CancelToken::is_cancelled)
            {
                return Err(abort(Error::Cancelled(format!("upload of {filename}"))));
            }

            let cmd = Command::from(CommandFrame::write_chunk(filename, chunk.mode, chunk.data))
                .with_cancel(self.cancel.clone());
            retry
                .run("write-chunk", |_| {
                    let resp = self.channel.send_command(&cmd)?;
                    if resp.is_completion() {
                        Ok(())
                    } else {
                        Err(Error::UnexpectedResponse {
                            operation: "write-chunk",
                            response: resp.text(),
                        })
                    }
                })
                .map_err(abort)?;

            sent += chunk.data.len();
            debug!(
                "{filename}: chunk {}/{total_chunks} acknowledged ({sent}/{} bytes)",
                chunk.index + 1,
                content.len()
            );
            progress(&TransferProgress {
                filename: filename.to_string(),
                bytes_transferred: sent,
                total_bytes: content.len(),
                chunk_index: chunk.index,
                total_chunks,
            });
        }

        let verified = if options.verify {
            self.verify_upload(filename, content)?;
            true
        } else {
            false
        };

        Ok(TransferReport {
            filename: filename.to_string(),
            bytes: content.len(),
            chunks: total_chunks,
            chunk_size,
            elapsed: started.elapsed(),
            verified,
        })
    }

    /// Read a whole file from the device.
    pub fn download_file(&self, filename: &str) -> Result<Vec<u8>> {
        let cmd = Command::from(CommandFrame::get_file(filename)).with_cancel(self.cancel.clone());
        let resp = self
            .retry
            .send_with_retry(self.channel, &cmd)?;
        debug!("Downloaded {filename}: {} bytes", resp.data.len());
        Ok(resp.data)
    }

    /// Read `filename` back and compare it with `expected`.
    pub fn verify_upload(&self, filename: &str, expected: &[u8]) -> Result<()> {
        let actual = self.download_file(filename)?;
        let mismatch = |detail: String| Error::VerifyMismatch {
            filename: filename.to_string(),
            detail,
        };

        if let Some(offset) = actual
            .iter()
            .zip(expected)
            .position(|(a, e)| a != e)
        {
            return Err(mismatch(format!("first difference at byte {offset}")));
        }
        if actual.len() != expected.len() {
            return Err(mismatch(format!(
                "device has {} bytes, expected {}",
                actual.len(),
                expected.len()
            )));
        }
        info!("Verified {filename} ({} bytes)", actual.len());
        Ok(())
    }
}
