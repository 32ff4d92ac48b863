//! Buffered connection adapter (§4.5).
//!
//! `tokio::io::BufReader<S>` already gives us everything the adapter needs for
//! free: `fill_buf` peeks without consuming, and once a byte has been peeked,
//! every subsequent `AsyncRead` call (including the ones a TLS library makes)
//! drains the rest of the internal buffer before touching the live stream. That
//! is exactly the "peeked byte ++ drained buffer ++ live stream" ordering §4.4 and
//! §8 invariant 4 require, so there is no need for a hand-rolled composite
//! reader — only a type alias and a peek helper.

use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};

/// A client-side stream wrapped for one-byte lookahead (§4.5). `BufReader<S>`
/// forwards `AsyncWrite` straight to `S` when `S` implements it, and dropping the
/// adapter drops `S` — the adapter never owns the socket's lifecycle separately.
pub type BufferedConn<S> = BufReader<S>;

pub fn wrap<S: AsyncRead + AsyncWrite + Unpin>(stream: S) -> BufferedConn<S> {
    BufReader::new(stream)
}

/// Peek at the next byte without consuming it (§4.1 `TLSPeek`). Returns `None`
/// at EOF.
pub async fn peek_byte<S: AsyncRead + Unpin>(conn: &mut BufferedConn<S>) -> io::Result<Option<u8>> {
    let buf = conn.fill_buf().await?;
    Ok(buf.first().copied())
}

/// Whether the unread portion of `conn` begins with `prefix`, without
/// consuming anything (§4.1 "Request classification" needs to recognize
/// `CONNECT` before any bytes are handed to the HTTP parser). A single
/// `fill_buf` is enough in practice — a request line always arrives in one
/// TCP segment — so this does not loop to accumulate more than one read.
pub async fn starts_with<S: AsyncRead + Unpin>(conn: &mut BufferedConn<S>, prefix: &[u8]) -> io::Result<bool> {
    let buf = conn.fill_buf().await?;
    Ok(buf.len() >= prefix.len() && &buf[..prefix.len()] == prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn peek_does_not_consume_the_byte() {
        let (mut client, server) = duplex(64);
        client.write_all(b"\x16hello").await.unwrap();

        let mut conn = wrap(server);
        let peeked = peek_byte(&mut conn).await.unwrap();
        assert_eq!(peeked, Some(0x16));

        let mut buf = [0u8; 6];
        tokio::io::AsyncReadExt::read_exact(&mut conn, &mut buf).await.unwrap();
        assert_eq!(&buf, b"\x16hello");
    }

    #[tokio::test]
    async fn starts_with_matches_without_consuming() {
        let (mut client, server) = duplex(64);
        client.write_all(b"CONNECT example.test:443 HTTP/1.1\r\n\r\n").await.unwrap();

        let mut conn = wrap(server);
        assert!(starts_with(&mut conn, b"CONNECT ").await.unwrap());
        assert!(!starts_with(&mut conn, b"GET ").await.unwrap());

        let mut line = String::new();
        tokio::io::AsyncBufReadExt::read_line(&mut conn, &mut line).await.unwrap();
        assert_eq!(line, "CONNECT example.test:443 HTTP/1.1\r\n");
    }
}
