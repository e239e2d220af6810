//! Newline-delimited JSON framing for signaling streams.
//!
//! Signaling rides byte streams (the dialer's raw broker socket, the
//! listener's multiplexed substreams), so frames are one JSON value per
//! line. JSON never contains a raw newline, which makes the framing
//! lossless.

use std::io;
use std::sync::Arc;

use broker_proto::BrokerMessage;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::Mutex;

pub(crate) struct FrameReader {
    inner: BufReader<ReadHalf<Box<dyn Io>>>,
    line: String,
}

pub(crate) struct FrameWriter {
    inner: WriteHalf<Box<dyn Io>>,
}

/// Shared handle so candidate callbacks and the negotiation task can
/// interleave frames on one stream.
pub(crate) type SharedFrameWriter = Arc<Mutex<FrameWriter>>;

pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Split a signaling stream into a frame reader and a shareable writer.
pub(crate) fn split(io: impl Io + 'static) -> (FrameReader, SharedFrameWriter) {
    let (read, write) = tokio::io::split(Box::new(io) as Box<dyn Io>);
    (
        FrameReader {
            inner: BufReader::new(read),
            line: String::new(),
        },
        Arc::new(Mutex::new(FrameWriter { inner: write })),
    )
}

impl FrameReader {
    /// Read the next frame; `None` on a clean EOF.
    pub(crate) async fn read_frame(&mut self) -> io::Result<Option<BrokerMessage>> {
        self.line.clear();
        let n = self.inner.read_line(&mut self.line).await?;
        if n == 0 {
            return Ok(None);
        }
        serde_json::from_str(&self.line)
            .map(Some)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

impl FrameWriter {
    pub(crate) async fn write_frame(&mut self, msg: &BrokerMessage) -> io::Result<()> {
        let mut data = serde_json::to_vec(msg)?;
        data.push(b'\n');
        self.inner.write_all(&data).await?;
        self.inner.flush().await
    }

    /// Half-close the write side; the remote read loop sees EOF.
    pub(crate) async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}
