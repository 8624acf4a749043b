//! Client side of the routing socket

use std::path::Path;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

use super::codec::FrameCodec;
use super::protocol::{Request, Response};
use crate::error::{Error, Result};
use crate::routing::{BackendId, ContentDescriptor, RoutingPriority, RoutingStrategy};

/// Default deadline for connecting and for each round trip
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection to a running routing server
///
/// One connection carries any number of sequential requests.
#[derive(Debug)]
pub struct RoutingClient {
    framed: Framed<UnixStream, FrameCodec<Response, Request>>,
    timeout: Duration,
}

impl RoutingClient {
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        Self::connect_with_timeout(socket_path, DEFAULT_CLIENT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        socket_path: impl AsRef<Path>,
        deadline: Duration,
    ) -> Result<Self> {
        let path = socket_path.as_ref();
        let stream = timeout(deadline, UnixStream::connect(path))
            .await
            .map_err(|_| Error::ConnectionTimeout(deadline))??;
        debug!(path = %path.display(), "Connected to routing server");

        Ok(Self {
            framed: Framed::new(stream, FrameCodec::new()),
            timeout: deadline,
        })
    }

    /// Ask the server for a backend
    pub async fn select_backend(
        &mut self,
        content: &ContentDescriptor,
        strategy: Option<RoutingStrategy>,
        priority: Option<RoutingPriority>,
        available: Option<&[BackendId]>,
    ) -> Result<BackendId> {
        let request = Request::SelectBackend {
            content: content.into(),
            strategy,
            priority,
            available: available.map(<[BackendId]>::to_vec),
        };
        match self.call(request).await? {
            Response::Selected { backend_id, .. } => Ok(backend_id),
            other => Err(unexpected(&other)),
        }
    }

    /// Report the outcome of an operation on `backend_id`
    pub async fn record_outcome(
        &mut self,
        backend_id: &str,
        content: &ContentDescriptor,
        success: bool,
        duration_ms: Option<u64>,
    ) -> Result<()> {
        match self
            .call(Request::outcome(backend_id, content, success, duration_ms))
            .await?
        {
            Response::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Round trip without side effects; returns the server protocol version
    pub async fn ping(&mut self) -> Result<u8> {
        match self.call(Request::Ping).await? {
            Response::Pong { version } => Ok(version),
            other => Err(unexpected(&other)),
        }
    }

    /// Send every request before reading any response
    ///
    /// Responses come back in request order. Error responses are returned
    /// as values, not as `Err`.
    pub async fn pipeline(&mut self, requests: Vec<Request>) -> Result<Vec<Response>> {
        let count = requests.len();
        for request in requests {
            guarded(self.timeout, self.framed.feed(request)).await?;
        }
        guarded(self.timeout, self.framed.flush()).await?;

        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(self.receive().await?);
        }
        Ok(responses)
    }

    /// Close the connection
    pub async fn disconnect(mut self) -> Result<()> {
        guarded(self.timeout, self.framed.close()).await?;
        debug!("Disconnected from routing server");
        Ok(())
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        guarded(self.timeout, self.framed.send(request)).await?;
        self.receive().await?.into_result()
    }

    async fn receive(&mut self) -> Result<Response> {
        let deadline = self.timeout;
        match timeout(deadline, self.framed.next()).await {
            Err(_) => Err(Error::ConnectionTimeout(deadline)),
            Ok(None) => Err(Error::ProtocolError(
                "server closed the connection".to_string(),
            )),
            Ok(Some(frame)) => frame,
        }
    }
}

async fn guarded<F>(deadline: Duration, fut: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    timeout(deadline, fut)
        .await
        .map_err(|_| Error::ConnectionTimeout(deadline))?
}

fn unexpected(response: &Response) -> Error {
    Error::ProtocolError(format!("unexpected response {:?}", response))
}
