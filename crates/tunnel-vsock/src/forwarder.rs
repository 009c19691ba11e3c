//! Bidirectional frame forwarding between the TAP device and the transport.
//!
//! Each session runs two tasks:
//! - outbound: device read → encode → transport write
//! - inbound: transport read → decode → device write
//!
//! The tasks share nothing but a [`FailureSlot`]. Whichever fails first
//! reports its error; the session owner then aborts both tasks, which drops
//! every device and transport half they own.

use crate::codec::{self, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
use crate::error::{BridgeError, BridgeResult};
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Single-slot failure channel shared by both directions.
///
/// Only the first reported error is ever delivered. Later reports are logged
/// and dropped.
#[derive(Clone)]
pub struct FailureSlot {
    claimed: Arc<AtomicBool>,
    tx: mpsc::Sender<BridgeError>,
}

impl FailureSlot {
    /// Create a slot and the receiver that observes its one value.
    pub fn new() -> (Self, mpsc::Receiver<BridgeError>) {
        let (tx, rx) = mpsc::channel(1);
        let slot = Self {
            claimed: Arc::new(AtomicBool::new(false)),
            tx,
        };
        (slot, rx)
    }

    /// Report a failure from `direction`. Returns whether it was the first.
    pub fn report(&self, direction: &str, err: BridgeError) -> bool {
        if self.claimed.swap(true, Ordering::AcqRel) {
            log::debug!("Discarding {} error after first failure: {}", direction, err);
            return false;
        }
        log::debug!("{} failed first: {}", direction, err);
        // Capacity 1 and a single winner, so this cannot be full. A closed
        // receiver means the session is already being torn down.
        let _ = self.tx.try_send(err);
        true
    }
}

/// Frames forwarded per direction, shared with the running tasks.
#[derive(Debug, Default)]
pub struct ForwardStats {
    device_to_transport: AtomicU64,
    transport_to_device: AtomicU64,
}

/// Point-in-time copy of [`ForwardStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardCounts {
    pub device_to_transport: u64,
    pub transport_to_device: u64,
}

impl ForwardStats {
    pub fn snapshot(&self) -> ForwardCounts {
        ForwardCounts {
            device_to_transport: self.device_to_transport.load(Ordering::Relaxed),
            transport_to_device: self.transport_to_device.load(Ordering::Relaxed),
        }
    }
}

/// Forward frames from the device to the transport until something fails.
///
/// One device read is one frame, and its wire record is handed to the
/// transport in a single write. If that write does not take the whole
/// payload the direction ends with [`BridgeError::ShortWrite`].
pub async fn device_to_transport<R, W>(
    device: &mut R,
    transport: &mut W,
    frames: &AtomicU64,
) -> BridgeResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frame = vec![0u8; MAX_FRAME_SIZE];
    let mut record = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + MAX_FRAME_SIZE);

    loop {
        let n = device.read(&mut frame).await?;
        if n == 0 {
            return Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "TAP device closed",
            )));
        }

        record.clear();
        codec::encode_into(&mut record, &frame[..n])?;

        // The record goes out in one write, like the frame came in with one read.
        let written = transport.write(&record).await?;
        let payload_written = written.saturating_sub(LENGTH_PREFIX_SIZE);
        if payload_written != n {
            return Err(BridgeError::ShortWrite {
                expected: n,
                written: payload_written,
            });
        }
        transport.flush().await?;

        frames.fetch_add(1, Ordering::Relaxed);
        log::trace!("device -> transport: {} bytes", n);
    }
}

/// Forward frames from the transport to the device until something fails.
///
/// Each decoded frame goes to the device in a single write. A device that
/// accepts a different byte count ends the direction with
/// [`BridgeError::ShortWrite`].
pub async fn transport_to_device<R, W>(
    transport: &mut R,
    device: &mut W,
    frames: &AtomicU64,
) -> BridgeResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frame = vec![0u8; MAX_FRAME_SIZE];

    loop {
        let n = codec::read_record(transport, &mut frame).await?;

        let written = device.write(&frame[..n]).await?;
        if written != n {
            return Err(BridgeError::ShortWrite {
                expected: n,
                written,
            });
        }

        frames.fetch_add(1, Ordering::Relaxed);
        log::trace!("transport -> device: {} bytes", n);
    }
}

/// The two forwarding tasks of one session.
pub struct Forwarder {
    outbound: JoinHandle<()>,
    inbound: JoinHandle<()>,
    failures: mpsc::Receiver<BridgeError>,
    stats: Arc<ForwardStats>,
}

impl Forwarder {
    /// Start both directions. Each task takes exclusive ownership of the
    /// halves it uses.
    pub fn spawn<DR, DW, TR, TW>(
        mut device_reader: DR,
        mut device_writer: DW,
        mut transport_reader: TR,
        mut transport_writer: TW,
    ) -> Self
    where
        DR: AsyncRead + Unpin + Send + 'static,
        DW: AsyncWrite + Unpin + Send + 'static,
        TR: AsyncRead + Unpin + Send + 'static,
        TW: AsyncWrite + Unpin + Send + 'static,
    {
        let (slot, failures) = FailureSlot::new();
        let stats = Arc::new(ForwardStats::default());

        let outbound = {
            let slot = slot.clone();
            let stats = stats.clone();
            tokio::spawn(async move {
                if let Err(e) = device_to_transport(
                    &mut device_reader,
                    &mut transport_writer,
                    &stats.device_to_transport,
                )
                .await
                {
                    slot.report("device -> transport", e);
                }
            })
        };

        let inbound = {
            let stats = stats.clone();
            tokio::spawn(async move {
                if let Err(e) = transport_to_device(
                    &mut transport_reader,
                    &mut device_writer,
                    &stats.transport_to_device,
                )
                .await
                {
                    slot.report("transport -> device", e);
                }
            })
        };

        Self {
            outbound,
            inbound,
            failures,
            stats,
        }
    }

    /// Wait for the first failure of either direction.
    pub async fn wait_failure(&mut self) -> BridgeError {
        match self.failures.recv().await {
            Some(err) => err,
            // Both tasks ended without reporting, which only a panic does.
            None => BridgeError::Io(std::io::Error::other(
                "forwarding tasks stopped without reporting an error",
            )),
        }
    }

    /// Current frame counts.
    pub fn counts(&self) -> ForwardCounts {
        self.stats.snapshot()
    }

    /// Abort both directions and wait for them to release their halves.
    ///
    /// Whatever the surviving direction was doing is discarded.
    pub async fn shutdown(self) -> ForwardCounts {
        self.outbound.abort();
        self.inbound.abort();

        for (name, handle) in [("outbound", self.outbound), ("inbound", self.inbound)] {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => log::error!("Forwarding task {} panicked: {}", name, e),
            }
        }

        let counts = self.stats.snapshot();
        log::info!(
            "Forwarding stopped: {} frames device -> transport, {} frames transport -> device",
            counts.device_to_transport,
            counts.transport_to_device
        );
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, ReadBuf};

    /// Reader that fails immediately.
    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }
    }

    /// Writer that accepts `shortfall` fewer bytes than offered and records each call.
    struct ShortWriter {
        shortfall: usize,
        calls: Arc<Mutex<Vec<usize>>>,
    }

    impl AsyncWrite for ShortWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.calls.lock().unwrap().push(buf.len());
            Poll::Ready(Ok(buf.len().saturating_sub(self.shortfall)))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn frame(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
    }

    #[tokio::test]
    async fn test_relays_both_directions() {
        let (mut tap_side, device) = duplex(128 * 1024);
        let (mut proxy_side, transport) = duplex(128 * 1024);
        let (device_reader, device_writer) = tokio::io::split(device);
        let (transport_reader, transport_writer) = tokio::io::split(transport);

        let forwarder = Forwarder::spawn(device_reader, device_writer, transport_reader, transport_writer);

        // device -> transport, one frame at a time so each read is one frame
        for (len, seed) in [(60, 1), (1514, 2), (9000, 3)] {
            let sent = frame(len, seed);
            tap_side.write_all(&sent).await.unwrap();
            let received = codec::decode(&mut proxy_side).await.unwrap();
            assert_eq!(received.as_ref(), sent.as_slice());
        }

        // transport -> device
        for (len, seed) in [(42, 4), (1500, 5)] {
            let sent = frame(len, seed);
            proxy_side.write_all(&codec::encode(&sent).unwrap()).await.unwrap();
            let mut received = vec![0u8; len];
            tap_side.read_exact(&mut received).await.unwrap();
            assert_eq!(received, sent);
        }

        let counts = forwarder.shutdown().await;
        assert_eq!(counts.device_to_transport, 3);
        assert_eq!(counts.transport_to_device, 2);
    }

    #[tokio::test]
    async fn test_device_short_write_stops_inbound() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let device_writer = ShortWriter {
            shortfall: 1,
            calls: calls.clone(),
        };
        let (_tap_side, device) = duplex(1024);
        let (mut proxy_side, transport) = duplex(64 * 1024);
        let (transport_reader, transport_writer) = tokio::io::split(transport);

        // Two records are queued; only the first may reach the device.
        let mut records = BytesMut::new();
        codec::encode_into(&mut records, &frame(60, 7)).unwrap();
        codec::encode_into(&mut records, &frame(80, 8)).unwrap();
        proxy_side.write_all(&records).await.unwrap();

        let mut forwarder = Forwarder::spawn(device, device_writer, transport_reader, transport_writer);

        match forwarder.wait_failure().await {
            BridgeError::ShortWrite { expected, written } => {
                assert_eq!(expected, 60);
                assert_eq!(written, 59);
            }
            other => panic!("expected ShortWrite, got {:?}", other),
        }
        assert_eq!(forwarder.counts().transport_to_device, 0);
        forwarder.shutdown().await;
        assert_eq!(*calls.lock().unwrap(), vec![60]);
    }

    #[tokio::test]
    async fn test_transport_zero_write_is_short_write() {
        let mut transport_writer = ShortWriter {
            shortfall: usize::MAX,
            calls: Arc::new(Mutex::new(Vec::new())),
        };
        let mut device = std::io::Cursor::new(frame(100, 9));
        let frames = AtomicU64::new(0);

        let err = device_to_transport(&mut device, &mut transport_writer, &frames)
            .await
            .unwrap_err();
        match err {
            BridgeError::ShortWrite { expected, written } => {
                assert_eq!(expected, 100);
                assert_eq!(written, 0);
            }
            other => panic!("expected ShortWrite, got {:?}", other),
        }
        assert_eq!(frames.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_transport_partial_write_is_short_write() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut transport_writer = ShortWriter {
            shortfall: 1,
            calls: calls.clone(),
        };
        let mut device = std::io::Cursor::new(frame(100, 10));
        let frames = AtomicU64::new(0);

        let err = device_to_transport(&mut device, &mut transport_writer, &frames)
            .await
            .unwrap_err();
        match err {
            BridgeError::ShortWrite { expected, written } => {
                assert_eq!(expected, 100);
                assert_eq!(written, 99);
            }
            other => panic!("expected ShortWrite, got {:?}", other),
        }
        // The remainder is not retried and the frame is not counted.
        assert_eq!(*calls.lock().unwrap(), vec![100 + LENGTH_PREFIX_SIZE]);
        assert_eq!(frames.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_device_eof_is_io_error() {
        let mut device = tokio::io::empty();
        let mut transport = Vec::new();
        let frames = AtomicU64::new(0);

        let err = device_to_transport(&mut device, &mut transport, &frames)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)));
        assert!(transport.is_empty());
    }

    #[tokio::test]
    async fn test_transport_eof_is_short_read() {
        let mut transport = std::io::Cursor::new(vec![4, 0, 1, 2]);
        let mut device = Vec::new();
        let frames = AtomicU64::new(0);

        let err = transport_to_device(&mut transport, &mut device, &frames)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ShortRead { expected: 4, received: 2 }));
        assert!(device.is_empty());
    }

    #[tokio::test]
    async fn test_both_directions_failing_reports_once() {
        let (_tap_side, device) = duplex(1024);
        let (_, device_writer) = tokio::io::split(device);
        let transport_reader = std::io::Cursor::new(Vec::new());
        let transport_writer = Vec::new();

        let mut forwarder =
            Forwarder::spawn(FailingReader, device_writer, transport_reader, transport_writer);

        let err = forwarder.wait_failure().await;
        assert!(matches!(
            err,
            BridgeError::Io(_) | BridgeError::ShortRead { .. }
        ));

        // Give the other direction time to fail as well.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(forwarder.failures.try_recv().is_err());
        forwarder.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_slot_keeps_first() {
        let (slot, mut rx) = FailureSlot::new();
        let other = slot.clone();

        assert!(slot.report("first", BridgeError::config("first")));
        assert!(!other.report("second", BridgeError::config("second")));
        assert!(!slot.report("third", BridgeError::config("third")));

        let err = rx.recv().await.unwrap();
        assert!(err.to_string().contains("first"));
        assert!(rx.try_recv().is_err());

        // Consuming the first value does not reopen the slot.
        assert!(!slot.report("fourth", BridgeError::config("fourth")));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_releases_halves() {
        let (mut tap_side, device) = duplex(1024);
        let (mut proxy_side, transport) = duplex(1024);
        let (device_reader, device_writer) = tokio::io::split(device);
        let (transport_reader, transport_writer) = tokio::io::split(transport);

        let forwarder = Forwarder::spawn(device_reader, device_writer, transport_reader, transport_writer);
        forwarder.shutdown().await;

        // Once both halves of each stream are dropped the peers see EOF.
        let mut buf = [0u8; 1];
        assert_eq!(tap_side.read(&mut buf).await.unwrap(), 0);
        assert_eq!(proxy_side.read(&mut buf).await.unwrap(), 0);
    }
}
