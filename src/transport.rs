//! # Row Transport
//!
//! The byte stream behind a writer/reader adapter pair.
//!
//! The writer adapter listens on its host at the leased port; the reader
//! adapter connects to it. Rows travel as newline-delimited JSON over the one
//! TCP connection, optionally gzip compressed, so they arrive in the order
//! they were sent.
//!
//! ```rust,no_run
//! use clusterweave::transport::{TransportConfig, TransportWriter, connect};
//! use clusterweave::partitioning::Row;
//!
//! # async fn run(row: Row) -> Result<(), clusterweave::transport::TransportError> {
//! let config = TransportConfig::default();
//! let writer = TransportWriter::bind("0.0.0.0:40000", config.clone()).await?;
//!
//! let reader = tokio::spawn(async move {
//!   let mut source = connect("10.0.0.1:40000", &config).await?;
//!   source.next().await
//! });
//!
//! let mut sink = writer.accept().await?;
//! sink.send(&row).await?;
//! sink.finish().await?;
//! # Ok(())
//! # }
//! ```

use crate::cluster::DEFAULT_SOCKET_BUFFER_SIZE;
use crate::distributed::splitter::AdapterEndpoint;
use crate::partitioning::Row;
use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::{sleep, timeout};
use tracing::debug;

/// Error type for row transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
  /// Network error.
  #[error("Network error: {0}")]
  Io(#[from] io::Error),
  /// A row could not be encoded or decoded.
  #[error("Serialization error: {0}")]
  Serialization(String),
  /// The writer could not be reached in time.
  #[error("Could not connect to {0} in time")]
  ConnectTimeout(String),
  /// The endpoint has no port bound yet.
  #[error("Adapter endpoint {0} has no port")]
  Unbound(String),
}

/// Options of one transport stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
  /// Socket buffer size in bytes.
  pub buffer_size: usize,
  /// Whether the stream is gzip compressed.
  pub compressed: bool,
  /// How long a reader keeps trying to reach its writer.
  pub connect_timeout: Duration,
}

impl Default for TransportConfig {
  fn default() -> Self {
    Self {
      buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
      compressed: true,
      connect_timeout: Duration::from_secs(30),
    }
  }
}

impl TransportConfig {
  /// Takes buffer size and compression from an adapter endpoint.
  pub fn from_endpoint(endpoint: &AdapterEndpoint) -> Self {
    Self {
      buffer_size: endpoint.buffer_size,
      compressed: endpoint.compressed,
      ..Self::default()
    }
  }

  /// Sets the compression flag.
  #[must_use]
  pub fn with_compression(mut self, compressed: bool) -> Self {
    self.compressed = compressed;
    self
  }

  /// Sets the reader's connect timeout.
  #[must_use]
  pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
    self.connect_timeout = connect_timeout;
    self
  }
}

/// Returns the `host:port` an endpoint's writer listens on.
///
/// # Errors
///
/// Returns [`TransportError::Unbound`] before ports were bound.
pub fn endpoint_address(endpoint: &AdapterEndpoint) -> Result<String, TransportError> {
  let port = endpoint
    .port
    .ok_or_else(|| TransportError::Unbound(endpoint.link.clone()))?;
  Ok(format!("{}:{}", endpoint.host, port))
}

/// Listening side of a writer adapter.
pub struct TransportWriter {
  listener: TcpListener,
  config: TransportConfig,
}

impl TransportWriter {
  /// Binds the writer's listening socket.
  pub async fn bind(addr: impl ToSocketAddrs, config: TransportConfig) -> Result<Self, TransportError> {
    let listener = TcpListener::bind(addr).await?;
    Ok(Self { listener, config })
  }

  /// Returns the bound address.
  pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
    Ok(self.listener.local_addr()?)
  }

  /// Waits for the reader to connect.
  pub async fn accept(self) -> Result<RowSink, TransportError> {
    let (stream, peer) = self.listener.accept().await?;
    stream.set_nodelay(true)?;
    debug!(peer = %peer, compressed = self.config.compressed, "Reader connected");
    let buffered = BufWriter::with_capacity(self.config.buffer_size, stream);
    let writer: Box<dyn AsyncWrite + Send + Unpin> = if self.config.compressed {
      Box::new(GzipEncoder::new(buffered))
    } else {
      Box::new(buffered)
    };
    Ok(RowSink { writer, rows: 0 })
  }
}

/// Sends rows to a reader adapter.
pub struct RowSink {
  writer: Box<dyn AsyncWrite + Send + Unpin>,
  rows: u64,
}

impl RowSink {
  /// Sends one row.
  pub async fn send(&mut self, row: &Row) -> Result<(), TransportError> {
    let mut line = serde_json::to_vec(row).map_err(|e| TransportError::Serialization(e.to_string()))?;
    line.push(b'\n');
    self.writer.write_all(&line).await?;
    self.rows += 1;
    Ok(())
  }

  /// Returns the number of rows sent.
  pub fn rows(&self) -> u64 {
    self.rows
  }

  /// Flushes and closes the stream. The reader sees end of stream once every
  /// row was delivered.
  pub async fn finish(mut self) -> Result<u64, TransportError> {
    self.writer.flush().await?;
    self.writer.shutdown().await?;
    Ok(self.rows)
  }
}

/// Connects a reader adapter to its writer, retrying until the writer
/// listens or the connect timeout passes.
pub async fn connect(addr: &str, config: &TransportConfig) -> Result<RowSource, TransportError> {
  let attempt = async {
    loop {
      match TcpStream::connect(addr).await {
        Ok(stream) => return stream,
        Err(e) => {
          debug!(addr, error = %e, "Writer not reachable yet");
          sleep(Duration::from_millis(50)).await;
        }
      }
    }
  };
  let stream = timeout(config.connect_timeout, attempt)
    .await
    .map_err(|_| TransportError::ConnectTimeout(addr.to_string()))?;
  stream.set_nodelay(true)?;

  let buffered = BufReader::with_capacity(config.buffer_size, stream);
  let reader: Box<dyn AsyncBufRead + Send + Unpin> = if config.compressed {
    Box::new(BufReader::new(GzipDecoder::new(buffered)))
  } else {
    Box::new(buffered)
  };
  Ok(RowSource {
    lines: reader.lines(),
    rows: 0,
  })
}

/// Receives rows from a writer adapter.
pub struct RowSource {
  lines: Lines<Box<dyn AsyncBufRead + Send + Unpin>>,
  rows: u64,
}

impl RowSource {
  /// Returns the next row, or `None` at end of stream.
  pub async fn next(&mut self) -> Result<Option<Row>, TransportError> {
    loop {
      let Some(line) = self.lines.next_line().await? else {
        return Ok(None);
      };
      if line.is_empty() {
        continue;
      }
      let row = serde_json::from_str(&line).map_err(|e| TransportError::Serialization(e.to_string()))?;
      self.rows += 1;
      return Ok(Some(row));
    }
  }

  /// Returns the number of rows received.
  pub fn rows(&self) -> u64 {
    self.rows
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn row(i: i64) -> Row {
    json!({"id": i, "name": format!("row-{i}")})
      .as_object()
      .cloned()
      .unwrap()
  }

  async fn round_trip(compressed: bool) {
    let config = TransportConfig::default()
      .with_compression(compressed)
      .with_connect_timeout(Duration::from_secs(5));
    let writer = TransportWriter::bind("127.0.0.1:0", config.clone()).await.unwrap();
    let addr = writer.local_addr().unwrap().to_string();

    let reader = tokio::spawn(async move {
      let mut source = connect(&addr, &config).await.unwrap();
      let mut ids = Vec::new();
      while let Some(row) = source.next().await.unwrap() {
        ids.push(row["id"].as_i64().unwrap());
      }
      ids
    });

    let mut sink = writer.accept().await.unwrap();
    for i in 0..1000 {
      sink.send(&row(i)).await.unwrap();
    }
    assert_eq!(sink.finish().await.unwrap(), 1000);

    let ids = reader.await.unwrap();
    assert_eq!(ids, (0..1000).collect::<Vec<i64>>());
  }

  #[tokio::test]
  async fn test_rows_arrive_in_order_uncompressed() {
    round_trip(false).await;
  }

  #[tokio::test]
  async fn test_rows_arrive_in_order_compressed() {
    round_trip(true).await;
  }

  #[tokio::test]
  async fn test_connect_times_out_without_writer() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let config = TransportConfig::default().with_connect_timeout(Duration::from_millis(200));
    assert!(matches!(
      connect(&addr, &config).await,
      Err(TransportError::ConnectTimeout(_))
    ));
  }

  #[test]
  fn test_unbound_endpoint() {
    let endpoint = AdapterEndpoint {
      link: "a.0 -> b.0".to_string(),
      peer_node: "slave1".to_string(),
      host: "10.0.0.1".to_string(),
      port: None,
      buffer_size: 1024,
      compressed: false,
    };
    assert!(matches!(
      endpoint_address(&endpoint),
      Err(TransportError::Unbound(_))
    ));
    let bound = AdapterEndpoint {
      port: Some(40001),
      ..endpoint
    };
    assert_eq!(endpoint_address(&bound).unwrap(), "10.0.0.1:40001");
    assert_eq!(TransportConfig::from_endpoint(&bound).buffer_size, 1024);
  }
}
