//! Vsock Dialer (spec §4.4): connects to the hypervisor's vsock
//! multiplexer UDS and performs the `CONNECT <port>\n` / `OK <bufsize>\n`
//! handshake. The exact wire exchange is grounded in the handshake helper
//! found in the benchmark harness's firecracker vsock client
//! (`firecracker_handshake`) among the retrieved examples.

use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use sandbox_types::{SandboxError, SandboxResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::UnixStream;

const MAX_HANDSHAKE_LINE: usize = 4096;

/// A byte stream to a guest vsock port, with any bytes read past the `OK`
/// handshake line spliced back in ahead of the raw socket (spec §4.4 point
/// 4, and the "buffered vsock reads" design note in spec §9).
pub struct VsockStream {
    leftover: Bytes,
    inner: UnixStream,
}

impl AsyncRead for VsockStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.leftover.is_empty() {
            let n = std::cmp::min(buf.remaining(), this.leftover.len());
            buf.put_slice(&this.leftover[..n]);
            this.leftover.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for VsockStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Dials the vsock multiplexer at `uds_path` and performs the CONNECT/OK
/// handshake for guest port `port`.
pub async fn dial(uds_path: &Path, port: u32) -> SandboxResult<VsockStream> {
    let mut stream = UnixStream::connect(uds_path)
        .await
        .map_err(|e| SandboxError::AgentUnreachable(format!("vsock connect failed: {e}")))?;

    stream
        .write_all(format!("CONNECT {port}\n").as_bytes())
        .await
        .map_err(|e| SandboxError::AgentUnreachable(format!("vsock connect write failed: {e}")))?;

    let mut buf = Vec::with_capacity(64);
    let mut scratch = [0u8; 256];
    loop {
        let n = stream
            .read(&mut scratch)
            .await
            .map_err(|e| SandboxError::AgentUnreachable(format!("vsock handshake read failed: {e}")))?;
        if n == 0 {
            return Err(SandboxError::AgentUnreachable(
                "vsock-connect-failed: connection closed before OK line".into(),
            ));
        }
        buf.extend_from_slice(&scratch[..n]);
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
            let leftover = Bytes::copy_from_slice(&buf[pos + 1..]);
            if !line.starts_with("OK") {
                return Err(SandboxError::AgentUnreachable(format!("vsock-connect-failed: {line}")));
            }
            return Ok(VsockStream { leftover, inner: stream });
        }
        if buf.len() > MAX_HANDSHAKE_LINE {
            return Err(SandboxError::AgentUnreachable(
                "vsock-connect-failed: handshake line too long".into(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn handshake_succeeds_and_preserves_buffered_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&sock_path).unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut line = [0u8; 64];
            let n = sock.read(&mut line).await.unwrap();
            assert_eq!(&line[..n], b"CONNECT 1024\n");
            // OK line followed immediately by payload bytes in the same write,
            // exercising the "preserve buffered bytes" requirement.
            sock.write_all(b"OK 4096\nhello").await.unwrap();
            sock.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        });

        let mut stream = dial(&sock_path, 1024).await.unwrap();
        let mut got = [0u8; 5];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn non_ok_line_is_reported_as_agent_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&sock_path).unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"ERR no such port\n").await.unwrap();
        });

        let result = dial(&sock_path, 9999).await;
        assert!(matches!(result, Err(SandboxError::AgentUnreachable(_))));
        server.await.unwrap();
    }
}
