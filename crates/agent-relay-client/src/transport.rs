//! Stream transport seam.
//!
//! The connection manager only sees a boxed stream of byte chunks; the
//! HTTP implementation consumes the server-push endpoint, and tests feed
//! scripted chunks through a channel.

use std::collections::VecDeque;
use std::sync::Mutex;

use agent_relay_core::SessionId;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Transport error. Always retryable; the graceful server close travels
/// in-band as a `stream_end` event, never as an error.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("stream exhausted")]
    Exhausted,
}

/// Boxed byte-chunk stream.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Opens the server-push stream for a session.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open the stream for `session_id`.
    ///
    /// `reconnect` is set on every attempt after the first, asking the
    /// server not to replay history the client already buffered.
    async fn open(
        &self,
        session_id: &SessionId,
        reconnect: bool,
    ) -> Result<ByteStream, TransportError>;
}

/// HTTP implementation over `GET /sessions/{id}/stream`.
pub struct HttpStreamTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStreamTransport {
    /// Create a transport for the given server base URL.
    #[must_use]
    pub fn new<S: Into<String>>(base_url: S) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn open(
        &self,
        session_id: &SessionId,
        reconnect: bool,
    ) -> Result<ByteStream, TransportError> {
        let mut url = format!(
            "{}/sessions/{session_id}/stream?activeOnly=1",
            self.base_url.trim_end_matches('/')
        );
        if reconnect {
            url.push_str("&skipReplay=1");
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Connect(format!(
                "status {}",
                response.status()
            )));
        }
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::Stream(e.to_string())))
            .boxed())
    }
}

/// One scripted `open` outcome for [`ChannelTransport`].
pub enum ScriptedOpen {
    /// The connection attempt fails.
    Fail(TransportError),
    /// A fixed sequence of chunks, then end of stream.
    Chunks(Vec<Result<Bytes, TransportError>>),
    /// A live channel the test keeps feeding.
    Live(mpsc::UnboundedReceiver<Result<Bytes, TransportError>>),
}

/// Scripted transport for tests and demos: each `open` call consumes the
/// next scripted outcome.
#[derive(Default)]
pub struct ChannelTransport {
    attempts: Mutex<VecDeque<ScriptedOpen>>,
    opens: Mutex<Vec<bool>>,
}

impl ChannelTransport {
    /// Create an empty transport; push attempts before use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failing connection attempt.
    pub fn push_failure(&self, error: TransportError) {
        self.attempts
            .lock()
            .unwrap()
            .push_back(ScriptedOpen::Fail(error));
    }

    /// Queue a successful attempt delivering `chunks` then ending.
    pub fn push_chunks<I>(&self, chunks: I)
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        self.attempts
            .lock()
            .unwrap()
            .push_back(ScriptedOpen::Chunks(
                chunks.into_iter().map(|c| Ok(c.into())).collect(),
            ));
    }

    /// Queue a successful attempt ending with a transport error.
    pub fn push_chunks_then_error<I>(&self, chunks: I, error: TransportError)
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        let mut items: Vec<Result<Bytes, TransportError>> =
            chunks.into_iter().map(|c| Ok(c.into())).collect();
        items.push(Err(error));
        self.attempts
            .lock()
            .unwrap()
            .push_back(ScriptedOpen::Chunks(items));
    }

    /// The `reconnect` flag of each `open` call so far, in order.
    #[must_use]
    pub fn reconnect_flags(&self) -> Vec<bool> {
        self.opens.lock().unwrap().clone()
    }

    /// Queue a live attempt; the returned sender feeds the stream.
    pub fn push_live(&self) -> mpsc::UnboundedSender<Result<Bytes, TransportError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attempts
            .lock()
            .unwrap()
            .push_back(ScriptedOpen::Live(rx));
        tx
    }
}

#[async_trait]
impl StreamTransport for ChannelTransport {
    async fn open(
        &self,
        _session_id: &SessionId,
        reconnect: bool,
    ) -> Result<ByteStream, TransportError> {
        self.opens.lock().unwrap().push(reconnect);
        let next = self.attempts.lock().unwrap().pop_front();
        match next {
            Some(ScriptedOpen::Fail(error)) => Err(error),
            Some(ScriptedOpen::Chunks(items)) => Ok(futures::stream::iter(items).boxed()),
            Some(ScriptedOpen::Live(rx)) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => Err(TransportError::Exhausted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_attempts_are_consumed_in_order() {
        let transport = ChannelTransport::new();
        transport.push_failure(TransportError::Connect("refused".into()));
        transport.push_chunks(["data\n"]);

        let id = SessionId::durable("s1");
        assert!(transport.open(&id, false).await.is_err());

        let mut stream = transport.open(&id, true).await.unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"data\n");
        assert!(stream.next().await.is_none());

        assert!(matches!(
            transport.open(&id, true).await,
            Err(TransportError::Exhausted)
        ));
        assert_eq!(transport.reconnect_flags(), vec![false, true, true]);
    }
}
