// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::Error as IOError;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// A duplex byte stream abstracting over a dialed connection, allowing use of
/// raw sockets, memory streams, TLS sessions, and multiplexed tunnel channels alike
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {
  fn as_dyn_mut<'a>(self: &'a mut Self) -> &'a mut dyn TunnelStream
  where
    Self: Sized,
  {
    self
  }
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

/// The connection type handed back by every [`Dialer`](crate::common::dialer::Dialer)
pub enum WrappedStream {
  Tcp(TcpStream),
  DuplexStream(DuplexStream),
  Boxed(Box<dyn TunnelStream + 'static>),
}

impl WrappedStream {
  #[cfg(test)]
  /// Asserts that WrappedStream complies with TunnelStream, Send, and Unpin traits
  fn _assert_traits() {
    let _x: &(dyn TunnelStream + Send + Unpin) =
      &WrappedStream::DuplexStream(tokio::io::duplex(64).0);
    unreachable!("Compile-time static assertion function should never be called");
  }

  pub fn duplex(max_buf_size: usize) -> (WrappedStream, WrappedStream) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (a.into(), b.into())
  }

  pub fn boxed<S: TunnelStream + 'static>(stream: S) -> Self {
    WrappedStream::Boxed(Box::new(stream))
  }

  /// The underlying socket, when the stream is a plain TCP connection
  pub fn as_tcp(&self) -> Option<&TcpStream> {
    match self {
      WrappedStream::Tcp(s) => Some(s),
      _ => None,
    }
  }
}

impl From<DuplexStream> for WrappedStream {
  fn from(stream: DuplexStream) -> Self {
    WrappedStream::DuplexStream(stream)
  }
}

impl From<TcpStream> for WrappedStream {
  fn from(stream: TcpStream) -> Self {
    WrappedStream::Tcp(stream)
  }
}

impl std::fmt::Debug for WrappedStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      WrappedStream::Tcp(s) => f.debug_tuple("Tcp").field(s).finish(),
      WrappedStream::DuplexStream(_) => f.write_str("DuplexStream"),
      WrappedStream::Boxed(_) => f.write_str("Boxed"),
    }
  }
}

impl AsyncRead for WrappedStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      WrappedStream::DuplexStream(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      WrappedStream::Boxed(ref mut s) => AsyncRead::poll_read(Pin::new(&mut **s), cx, buf),
    }
  }
}

impl AsyncWrite for WrappedStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      WrappedStream::Boxed(ref mut s) => AsyncWrite::poll_write(Pin::new(&mut **s), cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WrappedStream::Boxed(ref mut s) => AsyncWrite::poll_flush(Pin::new(&mut **s), cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WrappedStream::Boxed(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(&mut **s), cx),
    }
  }
}
