//! vsock transport to the host proxy.
//!
//! The enclave has no network device of its own; the only way out is an
//! `AF_VSOCK` stream to the parent instance. Once connected, a single HTTP
//! request announces that this side wants to tunnel Ethernet frames, after
//! which the stream carries nothing but wire records (see [`crate::codec`]).

use crate::config::TransportConfig;
use crate::error::{BridgeError, BridgeResult};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// User agent sent with the announce request.
const USER_AGENT: &str = concat!("tunnel-vsock/", env!("CARGO_PKG_VERSION"));

/// Connected `AF_VSOCK` stream to the host proxy.
///
/// A non-blocking socket registered with the tokio reactor. Reads and writes
/// go straight to the descriptor; shutdown closes the write side.
#[derive(Debug)]
pub struct VsockStream {
    inner: AsyncFd<OwnedFd>,
}

impl VsockStream {
    /// Register an already non-blocking stream socket with the runtime.
    fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }
}

impl AsyncRead for VsockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            let result = guard.try_io(|fd| {
                // SAFETY: `unfilled` is valid for writes of its full length.
                let n = unsafe {
                    libc::read(
                        fd.as_raw_fd(),
                        unfilled.as_mut_ptr() as *mut libc::c_void,
                        unfilled.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for VsockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;
            let result = guard.try_io(|fd| {
                // SAFETY: `buf` is valid for reads of its full length.
                let n = unsafe {
                    libc::send(
                        fd.as_raw_fd(),
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                        libc::MSG_NOSIGNAL,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(res) => return Poll::Ready(res),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // SAFETY: the descriptor is owned by `inner` and still open.
        let ret = unsafe { libc::shutdown(self.inner.as_raw_fd(), libc::SHUT_WR) };
        if ret < 0 {
            Poll::Ready(Err(io::Error::last_os_error()))
        } else {
            Poll::Ready(Ok(()))
        }
    }
}

/// Open a stream connection to the host proxy.
///
/// The connect is non-blocking; dropping the future closes the socket.
pub async fn connect(endpoint: &TransportConfig) -> BridgeResult<VsockStream> {
    let stream = connect_vsock(endpoint.cid, endpoint.port)
        .await
        .map_err(|e| {
            BridgeError::connect_with_source(format!("Failed to connect to {}", endpoint), e)
        })?;

    log::info!("Connected to host proxy at {}", endpoint);
    Ok(stream)
}

async fn connect_vsock(cid: u32, port: u32) -> io::Result<VsockStream> {
    // SAFETY: socket(2) has no memory preconditions; the result is checked below.
    let raw = unsafe {
        libc::socket(
            libc::AF_VSOCK,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: sockaddr_vm is plain old data; all-zero is a valid initial value.
    let mut addr: libc::sockaddr_vm = unsafe { std::mem::zeroed() };
    addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
    addr.svm_cid = cid;
    addr.svm_port = port;

    // SAFETY: `addr` is a valid sockaddr_vm and the length matches its size.
    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_vm as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t,
        )
    };
    let in_progress = if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
        true
    } else {
        false
    };

    let stream = VsockStream::from_fd(fd)?;
    if in_progress {
        // Completion shows up as writability; the outcome is in SO_ERROR.
        let _ready = stream.inner.writable().await?;
        take_socket_error(stream.inner.as_raw_fd())?;
    }
    Ok(stream)
}

fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `err` and `len` are valid for writes and `len` is the size of `err`.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

/// Build the announce request.
///
/// This is a bodiless `POST` in HTTP/1.1 wire form. The host proxy switches
/// the connection to raw frame mode after reading it and sends no response.
pub fn announce_request(endpoint: &TransportConfig) -> String {
    format!(
        "POST {} HTTP/1.1\r\nHost: {}:{}\r\nUser-Agent: {}\r\nContent-Length: 0\r\n\r\n",
        endpoint.path, endpoint.cid, endpoint.port, USER_AGENT
    )
}

/// Tell the host proxy that this side is ready to tunnel.
///
/// Fire-and-forget: nothing is read back, so acceptance is only implied by
/// frames flowing afterwards.
pub async fn announce<W>(writer: &mut W, endpoint: &TransportConfig) -> BridgeResult<()>
where
    W: AsyncWrite + Unpin,
{
    let request = announce_request(endpoint);
    writer
        .write_all(request.as_bytes())
        .await
        .map_err(|e| BridgeError::handshake_with_source("Failed to send announce request", e))?;
    writer
        .flush()
        .await
        .map_err(|e| BridgeError::handshake_with_source("Failed to flush announce request", e))?;

    log::info!("Sent announce request to host proxy ({} bytes)", request.len());
    Ok(())
}
