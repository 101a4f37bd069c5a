use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::client::TlsStream as TlsClientStream;
use tokio_rustls::server::TlsStream as TlsServerStream;

/// A bidirectional byte stream that an SMTP conversation can run over.
/// Plain sockets and their TLS-wrapped forms can be swapped in place
/// when STARTTLS upgrades a connection.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Debug + Unpin + Send {}
impl AsyncReadAndWrite for TlsClientStream<BoxedAsyncReadAndWrite> {}
impl AsyncReadAndWrite for TlsServerStream<BoxedAsyncReadAndWrite> {}
impl AsyncReadAndWrite for TcpStream {}
#[cfg(unix)]
impl AsyncReadAndWrite for UnixStream {}
impl AsyncReadAndWrite for DuplexStream {}

pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;
