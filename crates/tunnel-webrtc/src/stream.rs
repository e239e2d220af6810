//! The byte stream handed to callers for each application data channel.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use broker_proto::DialChannelResponse;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use webrtc::data::data_channel::{DataChannel, PollDataChannel};
use webrtc::data_channel::RTCDataChannel;

/// An ordered, reliable byte stream over one detached application data
/// channel. The response frame that precedes raw bytes is consumed before
/// the stream is handed out, so reads and writes here are payload only.
pub struct TunnelStream {
    dc: Arc<RTCDataChannel>,
    io: BufReader<PollDataChannel>,
}

impl fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelStream").finish_non_exhaustive()
    }
}

impl TunnelStream {
    pub(crate) fn new(dc: Arc<RTCDataChannel>, detached: Arc<DataChannel>) -> Self {
        Self {
            dc,
            io: BufReader::new(PollDataChannel::new(detached)),
        }
    }

    /// Read the single newline-terminated response frame.
    pub(crate) async fn read_response(&mut self) -> io::Result<DialChannelResponse> {
        let mut line = String::new();
        let n = self.io.read_line(&mut line).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        serde_json::from_str(&line).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    pub(crate) async fn write_response(
        &mut self,
        response: &DialChannelResponse,
    ) -> io::Result<()> {
        let mut data = serde_json::to_vec(response)?;
        data.push(b'\n');
        self.io.write_all(&data).await?;
        self.io.flush().await
    }

    /// Protocol label the channel was opened with.
    pub fn protocol(&self) -> String {
        self.dc.protocol().to_string()
    }

    /// Close the channel; the remote side's reads return EOF.
    pub async fn close(&self) {
        let _ = self.dc.close().await;
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
