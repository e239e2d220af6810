//! Broker WebSocket plumbing: authenticated dialing plus an adapter that
//! exposes a binary-frame socket as an ordered byte stream.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::TunnelError;

pub(crate) type BrokerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Map `http(s)` onto the equivalent WebSocket scheme; `ws(s)` URLs pass
/// through untouched.
pub(crate) fn websocket_url(url: &Url) -> Result<Url, TunnelError> {
    let mut url = url.clone();
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(TunnelError::Broker(format!(
                "unsupported broker scheme {other:?}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TunnelError::Broker("cannot rewrite broker scheme".into()))?;
    Ok(url)
}

/// Open a WebSocket to `url`, presenting `token` as a bearer credential.
/// An HTTP rejection surfaces with its status so callers can tell an auth
/// failure from an unreachable broker.
pub(crate) async fn connect(url: &Url, token: Option<&str>) -> Result<BrokerSocket, TunnelError> {
    let url = websocket_url(url)?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| TunnelError::Broker(err.to_string()))?;
    if let Some(token) = token {
        let value = format!("Bearer {token}")
            .parse()
            .map_err(|_| TunnelError::Broker("token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    match connect_async(request).await {
        Ok((socket, _)) => Ok(socket),
        Err(WsError::Http(response)) => Err(TunnelError::Broker(format!(
            "broker returned {}",
            response.status()
        ))),
        Err(err) => Err(TunnelError::Broker(err.to_string())),
    }
}

/// An ordered byte stream over a WebSocket's binary frames.
///
/// Frame boundaries are not preserved; this is the transport under the
/// signaling codec and the listener's multiplexer, both of which carry
/// their own framing.
pub(crate) struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    recv: Bytes,
}

impl<S> WsByteStream<S> {
    pub(crate) fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            recv: Bytes::new(),
        }
    }
}

fn to_io_error(err: WsError) -> io::Error {
    match err {
        WsError::Io(err) => err,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::from(io::ErrorKind::UnexpectedEof)
        }
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.recv.is_empty() {
                let n = self.recv.len().min(buf.remaining());
                buf.put_slice(&self.recv[..n]);
                self.recv.advance(n);
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => self.recv = Bytes::from(data),
                // Pings and pongs are answered by the socket itself; text
                // frames carry nothing in this protocol.
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Poll::Ready(Err(to_io_error(err))),
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(Pin::new(&mut self.inner).poll_ready(cx)).map_err(to_io_error)?;
        Pin::new(&mut self.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(to_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(to_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(to_io_error)
    }
}
