// Remote client: one request connection, reconnected lazily after any
// transport failure, plus subscriber connections for notifications.

use crate::config::Config;
use crate::error::{FramecastError, Result};
use crate::remote::framing::{read_multipart, write_multipart};
use crate::remote::messages::{Envelope, NotificationMessage, RequestMessage, ResponseMessage};
use crate::remote::socket_addr;
use futures::Stream;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub struct RemoteClient {
    endpoint: String,
    sub_endpoint: String,
    timeout: Duration,
    connection: Option<TcpStream>,
}

impl RemoteClient {
    pub fn new(endpoint: impl Into<String>, sub_endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            sub_endpoint: sub_endpoint.into(),
            timeout,
            connection: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.endpoint, &config.sub_endpoint, config.timeout())
    }

    pub fn endpoints(&self) -> (&str, &str) {
        (&self.endpoint, &self.sub_endpoint)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Sends one request and waits for its reply. A timeout or socket error
    /// drops the connection; the next call reconnects. Nothing is retried.
    pub async fn request(
        &mut self,
        request: RequestMessage,
        payload: Option<Vec<u8>>,
    ) -> Result<Envelope<ResponseMessage>> {
        let kind = request.kind();
        let parts = Envelope { header: request, payload }.encode()?;
        match timeout(self.timeout, self.round_trip(&parts)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                tracing::warn!("Client: {} failed: {}", kind, e);
                self.connection = None;
                Err(e)
            }
            Err(_) => {
                tracing::warn!("Client: {} timed out after {:?}, reconnecting", kind, self.timeout);
                self.connection = None;
                Err(FramecastError::transport(format!(
                    "no reply to {} within {:?}",
                    kind, self.timeout
                )))
            }
        }
    }

    pub async fn send_request(&mut self, request: RequestMessage) -> Result<ResponseMessage> {
        Ok(self.request(request, None).await?.header)
    }

    async fn round_trip(&mut self, parts: &[Vec<u8>]) -> Result<Envelope<ResponseMessage>> {
        if self.connection.is_none() {
            self.connection = Some(connect(&self.endpoint).await?);
        }
        let stream = self
            .connection
            .as_mut()
            .ok_or_else(|| FramecastError::transport("not connected"))?;
        write_multipart(stream, parts).await?;
        let reply = read_multipart(stream)
            .await?
            .ok_or_else(|| FramecastError::transport("server closed the connection"))?;
        Envelope::decode(reply)
    }

    /// Calls `callback` for every notification on a background task. Returns
    /// once the subscription is live.
    pub async fn subscribe<F>(&self, callback: F) -> Result<JoinHandle<()>>
    where
        F: Fn(NotificationMessage) + Send + 'static,
    {
        let mut stream = self.connect_subscriber().await?;
        Ok(tokio::spawn(async move {
            loop {
                match read_notification(&mut stream).await {
                    Ok(Some(notification)) => callback(notification),
                    Ok(None) => {
                        tracing::info!("Client: publisher closed the subscription");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Client: subscription failed: {}", e);
                        break;
                    }
                }
            }
        }))
    }

    /// Notifications as a stream; ends when the publisher closes.
    pub async fn notifications(&self) -> Result<impl Stream<Item = Result<NotificationMessage>>> {
        let mut stream = self.connect_subscriber().await?;
        Ok(async_stream::try_stream! {
            while let Some(notification) = read_notification(&mut stream).await? {
                yield notification;
            }
        })
    }

    async fn connect_subscriber(&self) -> Result<TcpStream> {
        let mut stream = timeout(self.timeout, connect(&self.sub_endpoint))
            .await
            .map_err(|_| FramecastError::transport(format!("cannot reach {}", self.sub_endpoint)))??;
        match timeout(self.timeout, read_notification(&mut stream)).await {
            Ok(Ok(Some(NotificationMessage::NtfSubscribed))) => Ok(stream),
            Ok(Ok(Some(other))) => Err(FramecastError::protocol(format!(
                "expected NTF_SUBSCRIBED, got {other:?}"
            ))),
            Ok(Ok(None)) => Err(FramecastError::transport("publisher closed during handshake")),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FramecastError::transport(format!(
                "no subscription handshake within {:?}",
                self.timeout
            ))),
        }
    }
}

async fn connect(endpoint: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(socket_addr(endpoint)?)
        .await
        .map_err(|e| FramecastError::transport(format!("cannot connect to {endpoint}: {e}")))?;
    stream
        .set_nodelay(true)
        .map_err(|e| FramecastError::transport(e.to_string()))?;
    Ok(stream)
}

async fn read_notification(stream: &mut TcpStream) -> Result<Option<NotificationMessage>> {
    match read_multipart(stream).await? {
        Some(parts) => Ok(Some(Envelope::<NotificationMessage>::decode(parts)?.header)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_timeout_drops_connection_and_reconnects() {
        // A server that accepts and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });

        let mut client = RemoteClient::new(endpoint, "tcp://127.0.0.1:1", Duration::from_millis(100));
        for _ in 0..2 {
            let err = client.send_request(RequestMessage::GetStatus).await.unwrap_err();
            assert!(err.is_transport(), "{err}");
            assert!(!client.is_connected());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
        drop(listener);
        let mut client = RemoteClient::new(endpoint, "tcp://127.0.0.1:1", Duration::from_millis(500));
        let err = client.send_request(RequestMessage::GetQuality).await.unwrap_err();
        assert!(matches!(err, FramecastError::Transport(_)));
    }

    #[tokio::test]
    async fn test_notifications_stream() {
        use futures::StreamExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sub_endpoint = format!("tcp://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for n in [
                NotificationMessage::NtfSubscribed,
                NotificationMessage::NtfFrame {
                    index: 2,
                    time: 0.1,
                    fps: 12.5,
                },
            ] {
                let parts = Envelope::new(n).encode().unwrap();
                write_multipart(&mut stream, &parts).await.unwrap();
            }
        });

        let client = RemoteClient::new("tcp://127.0.0.1:1", sub_endpoint, Duration::from_secs(2));
        let stream = client.notifications().await.unwrap();
        tokio::pin!(stream);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(
            first,
            NotificationMessage::NtfFrame {
                index: 2,
                time: 0.1,
                fps: 12.5
            }
        );
        assert!(stream.next().await.is_none());
    }
}
