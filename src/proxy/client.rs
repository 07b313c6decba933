use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::codec::{ResponseDecoder, encode_request};
use super::{ForwardFuture, Forwarder, ProxyError, Upstream};
use crate::{Method, Request, Response};

const READ_BUF_SIZE: usize = 8 * 1024;

/// Forwards requests to a single HTTP/1.1 backend.
///
/// Each request opens a fresh connection, writes the request with
/// `Connection: close`, and reads until the response is complete. The whole
/// exchange, connect included, is bounded by the configured timeout.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    upstream: Upstream,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(upstream: Upstream, timeout: Duration) -> Self {
        Self { upstream, timeout }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    async fn exchange(&self, request: Request) -> Result<Response, ProxyError> {
        let addr = self.upstream.socket_addr();
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ProxyError::Connect { addr: addr.clone(), source })?;

        let wire = encode_request(&self.upstream, &request);
        stream.write_all(&wire).await?;
        stream.flush().await?;

        let mut decoder = ResponseDecoder::new(*request.method() == Method::Head);
        let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
        let mut eof = false;
        loop {
            if let Some(response) = decoder.decode(&mut buf, eof)? {
                debug!(
                    backend = %addr,
                    status = response.status().as_u16(),
                    bytes = response.bytes().len(),
                    "backend responded"
                );
                return Ok(response);
            }
            if eof {
                return Err(ProxyError::MalformedResponse("backend closed the connection early".into()));
            }
            eof = stream.read_buf(&mut buf).await? == 0;
        }
    }
}

impl Forwarder for HttpForwarder {
    fn forward(&self, request: Request) -> ForwardFuture<'_> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, self.exchange(request)).await {
                Ok(result) => result,
                Err(_) => Err(ProxyError::Timeout(self.timeout)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;
    use tokio::net::TcpListener;

    // Accepts one connection, captures the request head, replies with `reply`.
    async fn one_shot_backend(reply: &'static [u8]) -> (Upstream, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                if socket.read_buf(&mut buf).await.unwrap() == 0 {
                    break;
                }
            }
            socket.write_all(reply).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf).into_owned()
        });
        let upstream = Upstream::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        (upstream, handle)
    }

    #[tokio::test]
    async fn round_trip_through_backend() {
        let (upstream, backend) = one_shot_backend(
            b"HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: 11\r\n\r\n{\"id\":\"42\"}",
        )
        .await;
        let forwarder = HttpForwarder::new(upstream, Duration::from_secs(5));

        let req = Request::new(Method::Get, "/things?x=1").with_peer_addr("192.0.2.1:4000".parse().unwrap());
        let res = forwarder.forward(req).await.unwrap();

        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(res.bytes().as_ref(), b"{\"id\":\"42\"}");

        let seen = backend.await.unwrap();
        assert!(seen.starts_with("GET /things?x=1 HTTP/1.1\r\n"));
        assert!(seen.contains("X-Forwarded-For: 192.0.2.1\r\n"));
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let upstream = Upstream::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        let forwarder = HttpForwarder::new(upstream, Duration::from_secs(5));
        let err = forwarder.forward(Request::new(Method::Get, "/")).await.unwrap_err();
        assert!(matches!(err, ProxyError::Connect { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn silent_backend_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let upstream = Upstream::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        let forwarder = HttpForwarder::new(upstream, Duration::from_millis(200));
        let err = forwarder.forward(Request::new(Method::Get, "/")).await.unwrap_err();
        assert!(matches!(err, ProxyError::Timeout(_)), "got {err:?}");
    }
}
