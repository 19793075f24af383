//! Serial Transport for the profiler's RS-232/USB-serial console
//!
//! Text commands are written with a line terminator and the reply is read
//! until the line goes quiet. File downloads send the download command and
//! then receive the file with XMODEM-1K on a blocking thread, publishing
//! progress and completion events as the blocks arrive. The XMODEM stream
//! carries no byte count, so no `FileSize` event is sent; the listing size
//! stays the descriptor's size.
//!
//! All serial I/O runs on Tokio's blocking pool; the port sits behind an
//! `Arc<Mutex<_>>` so one transfer holds it for its whole duration.

use super::xmodem::{self, XmodemError};
use super::{
    parse_directory_listing, DirectoryListing, Transport, TransportEvent, CANCEL_TRANSFER_CMD,
    DIRECTORY_CMD, DOWNLOAD_CMD, EVENT_CHANNEL_CAPACITY,
};
use crate::config::SerialOptions;
use crate::error::{AppResult, WaveError};
use async_trait::async_trait;
use serialport::SerialPort;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Per-read timeout of the underlying port.
const PORT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Silence after which a command reply is considered complete.
const REPLY_IDLE_GAP: Duration = Duration::from_millis(300);

type SharedPort = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

/// Serial link to the instrument.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    /// Overall limit for one command reply.
    reply_timeout: Duration,
    /// Line terminator for commands.
    line_terminator: String,
    port: SharedPort,
    open: AtomicBool,
    abort: Arc<AtomicBool>,
    events: broadcast::Sender<TransportEvent>,
}

impl SerialTransport {
    /// Create a closed transport for `port_name` at `baud_rate`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            port_name: port_name.into(),
            baud_rate,
            reply_timeout: Duration::from_secs(2),
            line_terminator: "\r".to_string(),
            port: Arc::new(Mutex::new(None)),
            open: AtomicBool::new(false),
            abort: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    /// Build from the persisted serial options.
    pub fn from_options(options: &SerialOptions) -> Self {
        Self::new(options.port.clone(), options.baud_rate)
            .with_reply_timeout(Duration::from_millis(options.read_timeout_ms))
    }

    /// Set the overall command reply timeout.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the line terminator for commands.
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Human-readable port description.
    pub fn info(&self) -> String {
        format!("SerialTransport({} @ {} baud)", self.port_name, self.baud_rate)
    }
}

fn read_reply(port: &mut dyn SerialPort, timeout: Duration) -> AppResult<String> {
    let mut reply = Vec::new();
    let mut buffer = [0u8; 256];
    let start = Instant::now();
    let mut last_data = start;

    loop {
        if start.elapsed() > timeout {
            break;
        }
        if !reply.is_empty() && last_data.elapsed() > REPLY_IDLE_GAP {
            break;
        }
        match port.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                reply.extend_from_slice(&buffer[..n]);
                last_data = Instant::now();
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(String::from_utf8_lossy(&reply).into_owned())
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&self) -> AppResult<()> {
        let name = self.port_name.clone();
        let baud = self.baud_rate;
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&name, baud).timeout(PORT_POLL_TIMEOUT).open()
        })
        .await??;

        *self.port.lock().await = Some(port);
        self.open.store(true, Ordering::SeqCst);
        info!(port = %self.port_name, baud = self.baud_rate, "Serial port opened");
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        self.abort.store(true, Ordering::Release);
        if self.port.lock().await.take().is_some() {
            info!(port = %self.port_name, "Serial port closed");
        }
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_command(&self, command: &str) -> AppResult<String> {
        if !self.is_open() {
            return Err(WaveError::NotConnected);
        }
        if command == CANCEL_TRANSFER_CMD {
            // Stop a running XMODEM receive so the port lock is released.
            self.abort.store(true, Ordering::Release);
        }

        let port = Arc::clone(&self.port);
        let line = format!("{}{}", command, self.line_terminator);
        let timeout = self.reply_timeout;
        let command_for_log = command.to_string();

        tokio::task::spawn_blocking(move || -> AppResult<String> {
            let mut guard = port.blocking_lock();
            let port = guard.as_mut().ok_or(WaveError::NotConnected)?;
            port.write_all(line.as_bytes())?;
            port.flush()?;
            debug!(command = %command_for_log, "Sent serial command");
            let reply = read_reply(port.as_mut(), timeout)?;
            debug!(bytes = reply.len(), "Received serial reply");
            Ok(reply)
        })
        .await?
    }

    async fn request_directory_listing(&self) -> AppResult<DirectoryListing> {
        let reply = self.send_command(DIRECTORY_CMD).await?;
        Ok(parse_directory_listing(&reply))
    }

    async fn download_file(&self, dest_dir: &Path, name: &str) -> AppResult<bool> {
        if !self.is_open() {
            return Err(WaveError::NotConnected);
        }
        self.abort.store(false, Ordering::Release);

        let guard = Arc::clone(&self.port).lock_owned().await;
        let dest = dest_dir.join(name);
        let file = File::create(&dest)?;
        let command = format!("{}{}{}", DOWNLOAD_CMD, name, self.line_terminator);
        let events = self.events.clone();
        let abort = Arc::clone(&self.abort);
        let name = name.to_string();

        tokio::task::spawn_blocking(move || {
            let mut guard = guard;
            let result = match guard.as_mut() {
                Some(port) => receive_file(
                    port.as_mut(),
                    &command,
                    file,
                    &abort,
                    |bytes_written| {
                        let _ = events.send(TransportEvent::Progress {
                            name: name.clone(),
                            bytes_written,
                        });
                    },
                ),
                None => Err(XmodemError::Aborted),
            };

            let success = match result {
                Ok(bytes) => {
                    info!(file = %name, bytes, "Download complete");
                    true
                }
                Err(err) => {
                    warn!(file = %name, error = %err, "Download failed");
                    false
                }
            };
            let _ = events.send(TransportEvent::Complete { name, success });
        });

        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

fn receive_file<F: FnMut(u64)>(
    port: &mut dyn SerialPort,
    command: &str,
    file: File,
    abort: &AtomicBool,
    on_progress: F,
) -> Result<u64, XmodemError> {
    port.write_all(command.as_bytes())?;
    port.flush()?;
    let mut out = BufWriter::new(file);
    let mut link = PortIo(port);
    xmodem::receive(&mut link, &mut out, abort, on_progress)
}

/// `Read + Write` view of a `dyn SerialPort` for the generic receiver.
struct PortIo<'a>(&'a mut dyn SerialPort);

impl Read for PortIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for PortIo<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}
