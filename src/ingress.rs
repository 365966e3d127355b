//! The TCP ingress: accepts connections, decodes length-delimited protobuf frames, and hands
//! each decoded sample to the collector. Grounded in `metrics-exporter-tcp`'s length-delimited
//! `prost` framing, applied to the inbound direction instead of the outbound one it uses.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::collector::{Collector, WriteError};
use crate::sample::Sample;
use crate::selfmetrics::{DropReason, SelfMetrics};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame length {0} exceeds configured buffer size {1}")]
    FrameTooLarge(u64, usize),
    #[error("length prefix exceeded 10 bytes")]
    VarintTooLong,
    #[error("i/o error reading frame: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed protobuf frame: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

/// Binds `addr` and runs the accept loop until `shutdown` fires.
pub async fn run(
    addr: SocketAddr,
    buffer_size: usize,
    collector: Arc<Collector>,
    self_metrics: Arc<SelfMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "ingress listener bound");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let collector = Arc::clone(&collector);
                let self_metrics = Arc::clone(&self_metrics);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer, buffer_size, collector, self_metrics, shutdown).await;
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("ingress listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    buffer_size: usize,
    collector: Arc<Collector>,
    self_metrics: Arc<SelfMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = std::time::Instant::now();
    let mut reader = BufReader::new(stream);
    let mut samples: u64 = 0;

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, buffer_size) => frame,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                info!(%peer, error = %err, "closing ingress connection after decode error");
                self_metrics.record_drop(DropReason::DecodeError);
                break;
            }
        };

        let wire_sample: crate::wire::Sample = match prost::Message::decode(frame) {
            Ok(s) => s,
            Err(err) => {
                info!(%peer, error = %err, "closing ingress connection after decode error");
                self_metrics.record_drop(DropReason::DecodeError);
                break;
            }
        };

        samples += 1;
        let sample = Sample::from_wire(wire_sample);
        if let Err(err) = collector.write(sample) {
            match err {
                WriteError::QueueFull => {
                    debug!(%peer, "ingress queue full, dropping sample");
                    self_metrics.record_ingress_dropped();
                    self_metrics.record_drop(DropReason::QueueFull);
                }
                WriteError::NotRunning => {
                    warn!(%peer, "collector not running, closing ingress connection");
                    break;
                }
            }
        }
    }

    self_metrics.record_ingress_request(samples, start.elapsed());
}

/// Reads one length-delimited frame: a protobuf varint prefix followed by that many bytes.
/// Returns `Ok(None)` on a clean EOF between frames (the peer closed the connection).
async fn read_frame(
    reader: &mut BufReader<TcpStream>,
    max_len: usize,
) -> Result<Option<BytesMut>, DecodeError> {
    let len = match read_varint(reader).await? {
        Some(len) => len,
        None => return Ok(None),
    };

    if len as usize > max_len {
        return Err(DecodeError::FrameTooLarge(len, max_len));
    }

    let mut buf = BytesMut::zeroed(len as usize);
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Reads a protobuf-style base-128 varint one byte at a time. Returns `Ok(None)` if the
/// stream is at EOF before any byte of the prefix is read.
async fn read_varint(reader: &mut BufReader<TcpStream>) -> Result<Option<u64>, DecodeError> {
    let mut value: u64 = 0;
    for i in 0..10 {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return if i == 0 { Ok(None) } else { Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()) };
        }
        value |= ((byte[0] & 0x7f) as u64) << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
    }
    Err(DecodeError::VarintTooLong)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener as TestListener;

    #[tokio::test]
    async fn reads_one_length_delimited_frame() {
        let listener = TestListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let msg = crate::wire::Sample {
                service: "shop".into(),
                name: "reqs".into(),
                kind: "c".into(),
                labels: Default::default(),
                value: 1.0,
                histogram_def: Vec::new(),
            };
            let mut payload = Vec::new();
            prost::Message::encode_length_delimited(&msg, &mut payload).unwrap();
            stream.write_all(&payload).await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let frame = read_frame(&mut reader, 65536).await.unwrap().unwrap();
        let decoded: crate::wire::Sample = prost::Message::decode(frame.freeze()).unwrap();
        assert_eq!(decoded.service, "shop");
        assert_eq!(decoded.name, "reqs");

        client.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_frame_exceeding_buffer_size() {
        let listener = TestListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let msg = crate::wire::Sample {
                service: "shop".into(),
                name: "reqs".into(),
                kind: "c".into(),
                labels: Default::default(),
                value: 1.0,
                histogram_def: Vec::new(),
            };
            let mut payload = Vec::new();
            prost::Message::encode_length_delimited(&msg, &mut payload).unwrap();
            stream.write_all(&payload).await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let result = read_frame(&mut reader, 2).await;
        assert!(matches!(result, Err(DecodeError::FrameTooLarge(_, 2))));
    }
}
