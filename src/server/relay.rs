//! Non-blocking byte pumping between two TCP streams.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio::net::TcpStream;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Progress {
    Read(usize),
    Idle,
    Eof,
}

/// Read at most `chunk` bytes from `from` and write them to `to`.
///
/// Whatever `to` does not accept right away stays in `pending`; the caller
/// must not read from `from` again until [`flush`] has emptied it.
pub(super) fn relay_chunk(
    from: &TcpStream,
    to: &TcpStream,
    pending: &mut BytesMut,
    chunk: usize,
) -> io::Result<Progress> {
    debug_assert!(pending.is_empty());

    pending.reserve(chunk);
    let mut limited = BufMut::limit(&mut *pending, chunk);
    match from.try_read_buf(&mut limited) {
        Ok(0) => Ok(Progress::Eof),
        Ok(n) => {
            flush(to, pending)?;
            Ok(Progress::Read(n))
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Progress::Idle),
        Err(e) => Err(e),
    }
}

/// Write as much of `pending` to `to` as it accepts without blocking.
pub(super) fn flush(to: &TcpStream, pending: &mut BytesMut) -> io::Result<usize> {
    let mut written = 0;
    while !pending.is_empty() {
        match to.try_write(pending) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                pending.advance(n);
                written += n;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_relay_chunk_is_bounded() {
        let (mut source, from) = socket_pair().await;
        let (to, mut sink) = socket_pair().await;

        source.write_all(b"hello, world").await.unwrap();
        drop(source);

        let mut pending = BytesMut::new();
        let mut relayed = 0;
        loop {
            from.readable().await.unwrap();
            match relay_chunk(&from, &to, &mut pending, 5).unwrap() {
                Progress::Read(n) => {
                    assert!(n <= 5);
                    relayed += n;
                }
                Progress::Idle => {}
                Progress::Eof => break,
            }
            assert!(pending.is_empty());
        }
        assert_eq!(relayed, 12);
        drop(to);

        let mut received = Vec::new();
        sink.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello, world");
    }

    #[tokio::test]
    async fn test_relay_chunk_eof() {
        let (source, from) = socket_pair().await;
        let (to, _sink) = socket_pair().await;
        drop(source);

        let mut pending = BytesMut::new();
        loop {
            from.readable().await.unwrap();
            if relay_chunk(&from, &to, &mut pending, 64).unwrap() == Progress::Eof {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_flush_empties_pending() {
        let (to, mut sink) = socket_pair().await;
        let mut pending = BytesMut::from(&b"buffered"[..]);

        to.writable().await.unwrap();
        assert_eq!(flush(&to, &mut pending).unwrap(), 8);
        assert!(pending.is_empty());

        let mut buf = [0u8; 8];
        sink.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"buffered");
    }
}
