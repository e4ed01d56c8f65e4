//! Control channel transport
//!
//! Owns the two byte streams to the daemon:
//!
//! - [`CommandWriter`]: the outbound command channel. Every clone shares one
//!   async mutex, so a command line is written and flushed as a unit and
//!   concurrent writers can never interleave bytes.
//! - [`EventReader`]: the inbound event channel, framed into lines with a
//!   hard length limit.
//!
//! Outbound faults close the writer; once closed every later write fails
//! with [`ApiError::ChannelClosed`]. Inbound end-of-stream is reported by
//! [`decode_loop`] as [`ApiError::ChannelClosed`].
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-5: Denial of Service Protection - Bounded line length and write timeout
//! - SI-4: System Monitoring - Continuous event stream from the daemon
//! - SI-11: Error Handling - Faults classified as local or fatal

use crate::error::{ApiError, Result};
use crate::event::{decode_line, Event};
use crate::Command;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default limit for a single inbound line (1 MiB)
/// NIST: SC-5 - Bounded buffering of untrusted input
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Default timeout for writing and flushing one command
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest line excerpt kept in a decode fault
const FAULT_EXCERPT_BYTES: usize = 256;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

struct WriterState {
    sink: Option<BoxedWriter>,
    closed: bool,
    lines_written: u64,
}

/// Shared, serialized writer for the daemon command channel
///
/// # NIST Controls
/// - SC-8: Transmission Integrity - One complete line per lock acquisition
#[derive(Clone)]
pub struct CommandWriter {
    state: Arc<Mutex<WriterState>>,
    dry_run: bool,
    write_timeout: Duration,
}

impl CommandWriter {
    /// Wrap an async byte sink.
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(WriterState {
                sink: Some(Box::new(writer)),
                closed: false,
                lines_written: 0,
            })),
            dry_run: false,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// A writer that logs each command instead of writing it anywhere.
    pub fn dry_run() -> Self {
        Self {
            state: Arc::new(Mutex::new(WriterState {
                sink: None,
                closed: false,
                lines_written: 0,
            })),
            dry_run: true,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Render and write one command.
    pub async fn send(&self, command: &Command) -> Result<()> {
        self.write_line(&command.render()).await
    }

    /// Write one newline-terminated line under the shared guard.
    ///
    /// # Errors
    ///
    /// Fails if the line contains a line break, the channel is closed, or
    /// the write does not complete within the write timeout. IO failures and
    /// timeouts close the channel.
    pub async fn write_line(&self, line: &str) -> Result<()> {
        if line.contains(['\n', '\r']) {
            return Err(ApiError::EmbeddedNewline(line.to_string()));
        }

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ApiError::ChannelClosed);
        }

        if self.dry_run {
            info!(command = %line, "[DRY RUN] Would write command");
            state.lines_written += 1;
            return Ok(());
        }

        let Some(sink) = state.sink.as_mut() else {
            return Err(ApiError::ChannelClosed);
        };

        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');

        let outcome = tokio::time::timeout(self.write_timeout, async {
            sink.write_all(&frame).await?;
            sink.flush().await
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                state.lines_written += 1;
                debug!(command = %line, "Wrote command");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, command = %line, "Command write failed, closing channel");
                state.sink = None;
                state.closed = true;
                Err(ApiError::Io(e))
            }
            Err(_) => {
                let ms = u64::try_from(self.write_timeout.as_millis()).unwrap_or(u64::MAX);
                error!(timeout_ms = ms, command = %line, "Command write timed out, closing channel");
                state.sink = None;
                state.closed = true;
                Err(ApiError::WriteTimeout(ms))
            }
        }
    }

    /// Flush and shut down the sink. Later writes fail.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.closed = true;
        if let Some(mut sink) = state.sink.take() {
            sink.flush().await?;
            sink.shutdown().await?;
        }
        Ok(())
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Number of lines written (or logged, in dry-run mode).
    pub async fn lines_written(&self) -> u64 {
        self.state.lock().await.lines_written
    }
}

impl std::fmt::Debug for CommandWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandWriter")
            .field("dry_run", &self.dry_run)
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

/// Line-framed reader for the daemon event channel
pub struct EventReader {
    inner: BufReader<BoxedReader>,
    max_line_bytes: usize,
}

impl EventReader {
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            inner: BufReader::new(Box::new(reader)),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// Read the next line without its terminator.
    ///
    /// Returns `Ok(None)` at end-of-stream. A final line without a trailing
    /// newline is still returned. Oversized lines are discarded up to the
    /// next newline and reported as [`ApiError::LineTooLong`]; the stream
    /// stays usable afterwards.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        let mut line: Vec<u8> = Vec::new();
        let mut discarding = false;

        loop {
            let (consumed, terminated) = {
                let available = self.inner.fill_buf().await?;
                if available.is_empty() {
                    if discarding {
                        return Err(ApiError::LineTooLong(self.max_line_bytes));
                    }
                    if line.is_empty() {
                        return Ok(None);
                    }
                    break;
                }

                let (chunk, consumed, terminated) =
                    match available.iter().position(|b| *b == b'\n') {
                        Some(idx) => (&available[..idx], idx + 1, true),
                        None => (available, available.len(), false),
                    };

                if !discarding {
                    if line.len() + chunk.len() > self.max_line_bytes {
                        discarding = true;
                        line.clear();
                    } else {
                        line.extend_from_slice(chunk);
                    }
                }
                (consumed, terminated)
            };

            self.inner.consume(consumed);
            if terminated {
                if discarding {
                    return Err(ApiError::LineTooLong(self.max_line_bytes));
                }
                break;
            }
        }

        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|_| ApiError::InvalidUtf8)
    }
}

/// Item produced by [`decode_loop`]
#[derive(Debug)]
pub enum Decoded {
    Event(Event),
    /// A line that could not be decoded; the loop kept going
    Fault { error: ApiError, line: String },
}

/// Continuously frame and decode the event channel.
///
/// Decode faults are forwarded as [`Decoded::Fault`] and never stop the loop.
/// Returns `Ok(())` when cancelled or when the consumer hangs up, and
/// `Err(ApiError::ChannelClosed)` when the daemon closes the stream.
///
/// # NIST Controls
/// - SI-4: System Monitoring - Perpetual inbound monitoring task
/// - SI-11: Error Handling - Per-line fault isolation
#[instrument(skip_all)]
pub async fn decode_loop(
    mut reader: EventReader,
    tx: mpsc::Sender<Decoded>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Decode loop cancelled");
                return Ok(());
            }
            next = reader.next_line() => next,
        };

        let item = match next {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_line(&line) {
                    Ok(event) => Decoded::Event(event),
                    Err(e) => {
                        let excerpt = excerpt(&line);
                        warn!(error = %e, line = %excerpt, "Dropping undecodable line");
                        Decoded::Fault {
                            error: e,
                            line: excerpt,
                        }
                    }
                }
            }
            Ok(None) => {
                error!("Event channel reached end-of-stream");
                return Err(ApiError::ChannelClosed);
            }
            Err(e) if e.is_local() => {
                warn!(error = %e, "Dropping unreadable line");
                Decoded::Fault {
                    error: e,
                    line: String::new(),
                }
            }
            Err(e) => {
                error!(error = %e, "Event channel read failed");
                return Err(e);
            }
        };

        if tx.send(item).await.is_err() {
            debug!("Event consumer hung up, stopping decode loop");
            return Ok(());
        }
    }
}

fn excerpt(line: &str) -> String {
    if line.len() <= FAULT_EXCERPT_BYTES {
        return line.to_string();
    }
    let mut end = FAULT_EXCERPT_BYTES;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &line[..end])
}

/// Named pipe locations used by the daemon's pipe-based process API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipePaths {
    /// FIFO the daemon reads commands from
    pub in_pipe: PathBuf,
    /// FIFO the daemon writes JSON events to
    pub out_pipe: PathBuf,
}

/// Verify both pipe paths exist and are FIFOs.
#[cfg(unix)]
pub fn check_pipes(paths: &PipePaths) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    for path in [&paths.in_pipe, &paths.out_pipe] {
        let metadata = std::fs::metadata(path).map_err(|e| ApiError::InvalidPipe {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if !metadata.file_type().is_fifo() {
            return Err(ApiError::InvalidPipe {
                path: path.display().to_string(),
                reason: "not a FIFO".to_string(),
            });
        }
    }
    Ok(())
}

/// The owned pair of channels to the daemon
pub struct Transport {
    writer: CommandWriter,
    reader: Option<EventReader>,
}

impl Transport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: CommandWriter::new(writer),
            reader: Some(EventReader::new(reader)),
        }
    }

    /// Process API mode: commands on stdout, events on stdin.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Pipe API mode. Both FIFOs must already be open on the daemon side.
    ///
    /// Must be called from within a Tokio runtime.
    #[cfg(unix)]
    #[instrument]
    pub fn open_pipes(paths: &PipePaths) -> Result<Self> {
        use tokio::net::unix::pipe;

        check_pipes(paths)?;
        let sender = pipe::OpenOptions::new().open_sender(&paths.in_pipe)?;
        let receiver = pipe::OpenOptions::new().open_receiver(&paths.out_pipe)?;
        info!(
            in_pipe = %paths.in_pipe.display(),
            out_pipe = %paths.out_pipe.display(),
            "Opened daemon pipes"
        );
        Ok(Self::new(receiver, sender))
    }

    /// Replace the command channel with a logging dry-run writer.
    pub fn into_dry_run(self) -> Self {
        let write_timeout = self.writer.write_timeout;
        Self {
            writer: CommandWriter::dry_run().with_write_timeout(write_timeout),
            reader: self.reader,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.writer = self.writer.with_write_timeout(write_timeout);
        self
    }

    pub fn writer(&self) -> &CommandWriter {
        &self.writer
    }

    /// Take the event reader; returns `None` if already taken.
    pub fn take_reader(&mut self) -> Option<EventReader> {
        self.reader.take()
    }

    pub fn into_parts(self) -> (CommandWriter, Option<EventReader>) {
        (self.writer, self.reader)
    }
}
