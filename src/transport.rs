/*
 * This file is part of Bridgehead.
 *
 * Copyright (C) 2025 Bridgehead contributors
 *
 * Bridgehead is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Bridgehead is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Bridgehead. If not, see <https://www.gnu.org/licenses/>.
 */

//! Serial transport: one reader task, one writer task, two single-slot mailboxes
//!
//! ```text
//!  control loop ──command──▶ [write mailbox] ──▶ writer ──▶ link
//!  control loop ◀─telemetry─ [read mailbox]  ◀── reader ◀── link
//! ```
//!
//! Each mailbox holds at most one frame, so the loop cannot queue a second
//! command before the writer took the first, and sees replies in the order
//! they arrived. Nothing here correlates a reply with its command; that relies
//! on the board answering every command exactly once.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::error::TransportError;
use crate::logger::should_log;
use crate::protocol::{LINE_TERMINATOR, MAX_LINE_LEN};

/// Frames a mailbox can hold before `send` waits
pub const MAILBOX_CAPACITY: usize = 1;

/// Raw command line, terminator included
pub type CommandFrame = Vec<u8>;

/// Trimmed, non-empty ASCII telemetry line
pub type TelemetryLine = String;

/// Capacity-1 channel used as a mailbox in both directions
pub fn mailbox<T>() -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
    mpsc::channel(MAILBOX_CAPACITY)
}

/// Cooperative cancellation shared by the reader, the writer and the control loop
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`Shutdown::trigger`] has been called on any clone
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this only returns on trigger
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaderStats {
    pub lines: u64,
    pub blank: u64,
    pub garbled: u64,
    pub timeouts: u64,
    pub io_errors: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub frames: u64,
    pub bytes: u64,
    pub errors: u64,
}

/// Turn a raw segment into a telemetry line. `Ok(None)` for blank lines.
pub fn decode_line(bytes: &[u8]) -> Result<Option<TelemetryLine>, TransportError> {
    if !bytes.is_ascii() {
        return Err(TransportError::NotAscii { len: bytes.len() });
    }
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

/// One terminator-delimited piece of the incoming byte stream
#[derive(Debug, PartialEq, Eq)]
enum Segment {
    /// Line content without the terminator
    Line(Vec<u8>),
    /// A line longer than the limit; its bytes were dropped while reading
    Oversize(usize),
    Eof,
}

/// Line splitter that never holds more than `max_len` bytes of one line.
///
/// A partial line lives in `self`, so [`BoundedLines::next_segment`] is
/// cancel safe: a timeout between chunks loses nothing.
struct BoundedLines<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
    max_len: usize,
    // Bytes thrown away from the current line once it went over `max_len`
    dropped: Option<usize>,
}

impl<R: AsyncRead + Unpin> BoundedLines<R> {
    fn new(link: R, max_len: usize) -> Self {
        Self { reader: BufReader::new(link), line: Vec::new(), max_len, dropped: None }
    }

    async fn next_segment(&mut self) -> io::Result<Segment> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(Segment::Eof);
            }

            let (take, found) = match available.iter().position(|b| *b == LINE_TERMINATOR) {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            };
            let content = &available[..if found { take - 1 } else { take }];

            match self.dropped.as_mut() {
                Some(dropped) => *dropped += content.len(),
                None if self.line.len() + content.len() > self.max_len => {
                    self.dropped = Some(self.line.len() + content.len());
                    self.line = Vec::new();
                }
                None => self.line.extend_from_slice(content),
            }
            self.reader.consume(take);

            if found {
                return Ok(match self.dropped.take() {
                    Some(len) => Segment::Oversize(len),
                    None => Segment::Line(std::mem::take(&mut self.line)),
                });
            }
        }
    }
}

/// Read lines from the link and hand them to the control loop, one at a time.
///
/// Runs until `shutdown` fires or the control loop drops its receiver.
pub async fn run_reader<R>(
    link: R,
    mailbox: mpsc::Sender<TelemetryLine>,
    read_timeout: Duration,
    shutdown: Shutdown,
) -> ReaderStats
where
    R: AsyncRead + Unpin,
{
    let mut lines = BoundedLines::new(link, MAX_LINE_LEN);
    let mut stats = ReaderStats::default();

    debug!("Reader started (read timeout {:?})", read_timeout);

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = timeout(read_timeout, lines.next_segment()) => read,
        };

        let bytes = match read {
            Err(_) => {
                stats.timeouts += 1;
                trace!("Read timed out with no complete line");
                continue;
            }
            Ok(Ok(Segment::Line(bytes))) => bytes,
            Ok(Ok(Segment::Oversize(len))) => {
                stats.garbled += 1;
                if should_log(stats.garbled) {
                    let e = TransportError::LineTooLong { len, max: MAX_LINE_LEN };
                    warn!("TRANSPORT: discarding line: {} (count: {})", e, stats.garbled);
                }
                continue;
            }
            Ok(Ok(Segment::Eof)) => {
                stats.io_errors += 1;
                if should_log(stats.io_errors) {
                    warn!("TRANSPORT: {} (count: {})", TransportError::Closed, stats.io_errors);
                }
                if idle(read_timeout, &shutdown).await {
                    break;
                }
                continue;
            }
            Ok(Err(e)) => {
                stats.io_errors += 1;
                if should_log(stats.io_errors) {
                    warn!("TRANSPORT: {} (count: {})", TransportError::Io(e), stats.io_errors);
                }
                if idle(read_timeout, &shutdown).await {
                    break;
                }
                continue;
            }
        };

        let line = match decode_line(&bytes) {
            Ok(Some(line)) => line,
            Ok(None) => {
                stats.blank += 1;
                continue;
            }
            Err(e) => {
                stats.garbled += 1;
                if should_log(stats.garbled) {
                    warn!("TRANSPORT: discarding line: {} (count: {})", e, stats.garbled);
                }
                continue;
            }
        };

        trace!("READ: {:?}", line);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = mailbox.send(line) => {
                if sent.is_err() {
                    debug!("Telemetry mailbox closed, reader exiting");
                    break;
                }
                stats.lines += 1;
            }
        }
    }

    info!(
        lines = stats.lines,
        blank = stats.blank,
        garbled = stats.garbled,
        timeouts = stats.timeouts,
        io_errors = stats.io_errors,
        "Reader stopped"
    );
    stats
}

/// Back off after a link error. Returns true if shutdown fired meanwhile.
async fn idle(period: Duration, shutdown: &Shutdown) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(period) => false,
    }
}

/// Write every command frame the control loop posts, in order.
///
/// Runs until `shutdown` fires or the control loop drops its sender.
pub async fn run_writer<W>(
    mut link: W,
    mut mailbox: mpsc::Receiver<CommandFrame>,
    shutdown: Shutdown,
) -> WriterStats
where
    W: AsyncWrite + Unpin,
{
    let mut stats = WriterStats::default();
    debug!("Writer started");

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = mailbox.recv() => match frame {
                Some(frame) => frame,
                None => {
                    debug!("Command mailbox closed, writer exiting");
                    break;
                }
            },
        };

        let written = tokio::select! {
            _ = shutdown.cancelled() => break,
            written = write_frame(&mut link, &frame) => written,
        };

        match written {
            Ok(()) => {
                stats.frames += 1;
                stats.bytes += frame.len() as u64;
                trace!("WRITE: {:?}", String::from_utf8_lossy(&frame));
            }
            Err(e) => {
                stats.errors += 1;
                if should_log(stats.errors) {
                    error!(
                        "TRANSPORT: failed to write command frame: {} (count: {})",
                        e, stats.errors
                    );
                }
            }
        }
    }

    info!(frames = stats.frames, bytes = stats.bytes, errors = stats.errors, "Writer stopped");
    stats
}

async fn write_frame<W>(link: &mut W, frame: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    link.write_all(frame).await?;
    link.flush().await?;
    Ok(())
}

/// The control loop's side of the transport
#[derive(Debug)]
pub struct LinkEnds {
    pub commands: mpsc::Sender<CommandFrame>,
    pub telemetry: mpsc::Receiver<TelemetryLine>,
}

/// Handles to the running reader and writer
#[derive(Debug)]
pub struct TransportTasks {
    reader: JoinHandle<ReaderStats>,
    writer: JoinHandle<WriterStats>,
}

impl TransportTasks {
    /// Wait for both tasks to finish (after shutdown) and collect their counters
    pub async fn join(self) -> (ReaderStats, WriterStats) {
        let reader = self.reader.await.unwrap_or_else(|e| {
            error!("Reader task failed: {}", e);
            ReaderStats::default()
        });
        let writer = self.writer.await.unwrap_or_else(|e| {
            error!("Writer task failed: {}", e);
            WriterStats::default()
        });
        (reader, writer)
    }
}

/// Spawn the reader and writer over the two halves of a link.
pub fn spawn_transport<R, W>(
    read_half: R,
    write_half: W,
    read_timeout: Duration,
    shutdown: &Shutdown,
) -> (LinkEnds, TransportTasks)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (command_tx, command_rx) = mailbox::<CommandFrame>();
    let (telemetry_tx, telemetry_rx) = mailbox::<TelemetryLine>();

    let reader = tokio::spawn(run_reader(read_half, telemetry_tx, read_timeout, shutdown.clone()));
    let writer = tokio::spawn(run_writer(write_half, command_rx, shutdown.clone()));

    (
        LinkEnds { commands: command_tx, telemetry: telemetry_rx },
        TransportTasks { reader, writer },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"1,2,3").unwrap(), Some("1,2,3".to_string()));
        assert_eq!(decode_line(b"  1,2,3 \r").unwrap(), Some("1,2,3".to_string()));
        assert_eq!(decode_line(b"").unwrap(), None);
        assert_eq!(decode_line(b" \t\r").unwrap(), None);
        assert!(matches!(
            decode_line(&[0x31, 0xff, 0x32]),
            Err(TransportError::NotAscii { len: 3 })
        ));
    }

    #[tokio::test]
    async fn test_bounded_lines_drops_runaway_line() {
        let (mut board, host) = duplex(64 * 1024);
        let mut lines = BoundedLines::new(host, MAX_LINE_LEN);

        // 16 KiB with no terminator: nothing completes, and memory stays capped
        board.write_all(&vec![b'7'; 16 * 1024]).await.unwrap();
        assert!(timeout(Duration::from_millis(20), lines.next_segment()).await.is_err());
        assert!(lines.line.len() <= MAX_LINE_LEN);

        board.write_all(b"\n1,2\n").await.unwrap();
        assert_eq!(lines.next_segment().await.unwrap(), Segment::Oversize(16 * 1024));
        assert_eq!(lines.next_segment().await.unwrap(), Segment::Line(b"1,2".to_vec()));

        drop(board);
        assert_eq!(lines.next_segment().await.unwrap(), Segment::Eof);
    }

    #[tokio::test]
    async fn test_bounded_lines_keeps_line_at_limit() {
        let (mut board, host) = duplex(1024);
        let mut lines = BoundedLines::new(host, 4);

        board.write_all(b"1234\n12345\n9\n").await.unwrap();
        assert_eq!(lines.next_segment().await.unwrap(), Segment::Line(b"1234".to_vec()));
        assert_eq!(lines.next_segment().await.unwrap(), Segment::Oversize(5));
        assert_eq!(lines.next_segment().await.unwrap(), Segment::Line(b"9".to_vec()));
    }

    #[tokio::test]
    async fn test_reader_discards_oversize_line_without_newline() {
        let (mut board, host) = duplex(1024);
        let (tx, mut rx) = mailbox();
        let shutdown = Shutdown::new();
        let read_timeout = Duration::from_millis(10);
        let reader = tokio::spawn(run_reader(host, tx, read_timeout, shutdown.clone()));

        // Noise spread over many reads and several read timeouts
        for _ in 0..64 {
            board.write_all(&[b'x'; 512]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        board.write_all(b"\n1,2\n").await.unwrap();

        let line = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(line.as_deref(), Some("1,2"));

        shutdown.trigger();
        let stats = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert_eq!(stats.lines, 1);
        assert_eq!(stats.garbled, 1);
        assert!(stats.timeouts >= 1);
    }

    #[tokio::test]
    async fn test_mailbox_holds_one_frame() {
        let (tx, mut rx) = mailbox::<u8>();
        tx.send(1).await.unwrap();
        assert!(tx.try_send(2).is_err(), "second frame must wait");
        assert_eq!(rx.recv().await, Some(1));
        assert!(tx.try_send(2).is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_wakes_all_clones() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(shutdown.is_triggered());
        // Already triggered: resolves immediately
        timeout(Duration::from_secs(1), shutdown.cancelled()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_skips_blank_and_garbled_lines() {
        let (mut board, host) = duplex(256);
        let (tx, mut rx) = mailbox();
        let shutdown = Shutdown::new();
        let reader = tokio::spawn(run_reader(host, tx, SHORT, shutdown.clone()));

        board.write_all(b"\n   \r\n").await.unwrap();
        board.write_all(&[0xde, 0xad, b'\n']).await.unwrap();
        board.write_all(b"1200,800\r\n").await.unwrap();

        let line = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(line.as_deref(), Some("1200,800"));

        shutdown.trigger();
        let stats = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert_eq!(stats.lines, 1);
        assert_eq!(stats.blank, 2);
        assert_eq!(stats.garbled, 1);
    }

    #[tokio::test]
    async fn test_reader_keeps_partial_line_across_timeouts() {
        let (mut board, host) = duplex(256);
        let (tx, mut rx) = mailbox();
        let shutdown = Shutdown::new();
        let read_timeout = Duration::from_millis(20);
        let reader = tokio::spawn(run_reader(host, tx, read_timeout, shutdown.clone()));

        board.write_all(b"12").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        board.write_all(b"34\n").await.unwrap();

        let line = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(line.as_deref(), Some("1234"));

        shutdown.trigger();
        let stats = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(stats.timeouts >= 1);
    }

    #[tokio::test]
    async fn test_reader_back_pressure_and_cancellation() {
        let (mut board, host) = duplex(256);
        let (tx, mut rx) = mailbox();
        let shutdown = Shutdown::new();
        let reader = tokio::spawn(run_reader(host, tx, SHORT, shutdown.clone()));

        board.write_all(b"a\nb\nc\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Mailbox holds "a"; the reader is parked sending "b"
        assert_eq!(rx.try_recv().ok().as_deref(), Some("a"));

        shutdown.trigger();
        let stats = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(stats.lines <= 2);
    }

    #[tokio::test]
    async fn test_reader_survives_closed_link_until_shutdown() {
        let (board, host) = duplex(64);
        drop(board);
        let (tx, _rx) = mailbox();
        let shutdown = Shutdown::new();
        let read_timeout = Duration::from_millis(10);
        let reader = tokio::spawn(run_reader(host, tx, read_timeout, shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!reader.is_finished());

        shutdown.trigger();
        let stats = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(stats.io_errors >= 1);
    }

    #[tokio::test]
    async fn test_writer_writes_frames_in_order() {
        let (host, mut board) = duplex(256);
        let (tx, rx) = mailbox();
        let shutdown = Shutdown::new();
        let writer = tokio::spawn(run_writer(host, rx, shutdown.clone()));

        tx.send(b"1,2\n".to_vec()).await.unwrap();
        tx.send(b"3,4\n".to_vec()).await.unwrap();

        let mut buf = vec![0u8; 8];
        timeout(Duration::from_secs(1), board.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"1,2\n3,4\n");

        shutdown.trigger();
        let stats = timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
        assert_eq!(stats, WriterStats { frames: 2, bytes: 8, errors: 0 });
    }

    #[tokio::test]
    async fn test_writer_exits_when_sender_dropped() {
        let (host, _board) = duplex(64);
        let (tx, rx) = mailbox::<CommandFrame>();
        let writer = tokio::spawn(run_writer(host, rx, Shutdown::new()));
        drop(tx);
        let stats = timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
        assert_eq!(stats.frames, 0);
    }

    #[tokio::test]
    async fn test_spawn_transport_round_trip() {
        let (host, board) = duplex(256);
        let (host_read, host_write) = tokio::io::split(host);
        let (mut board_read, mut board_write) = tokio::io::split(board);
        let shutdown = Shutdown::new();
        let (mut ends, tasks) = spawn_transport(host_read, host_write, SHORT, &shutdown);

        ends.commands.send(b"9,9\n".to_vec()).await.unwrap();
        let mut buf = [0u8; 4];
        board_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"9,9\n");

        board_write.write_all(b"100,200\n").await.unwrap();
        let line = timeout(Duration::from_secs(1), ends.telemetry.recv()).await.unwrap();
        assert_eq!(line.as_deref(), Some("100,200"));

        shutdown.trigger();
        let (reader, writer) = timeout(Duration::from_secs(1), tasks.join()).await.unwrap();
        assert_eq!(reader.lines, 1);
        assert_eq!(writer.frames, 1);
    }
}
