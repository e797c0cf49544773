use crate::config::LinkSettings;
use crate::error::{FrameError, LinkError};
use crate::protocol::{Command, Frame, FrameAssembler};
use thiserror::Error;
use tokio::time::{Duration, timeout};

/// Byte pipe to one BMS
///
/// Requests go out through `write`; responses arrive as notification chunks
/// of arbitrary size.
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError>;

    /// Wait at most `wait` for the next chunk; `Ok(None)` when nothing came
    async fn read_chunk(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, LinkError>;

    /// Release the connection. Must tolerate being called more than once.
    async fn close(&mut self);
}

/// Opens transports by unit address
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport + 'static;

    async fn connect(&self, address: &str) -> Result<Self::Transport, LinkError>;
}

/// Failure of a single [`LinkHandle::poll`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// An established session with one unit
pub struct LinkHandle<T> {
    address: String,
    transport: Option<T>,
    assembler: FrameAssembler,
    read_wait: Duration,
}

impl<T: Transport> LinkHandle<T> {
    /// Open a session, giving up after `link.connect_timeout`
    pub async fn connect<C>(connector: &C, address: &str, link: &LinkSettings) -> Result<Self, LinkError>
    where
        C: Connector<Transport = T>,
    {
        let transport = match timeout(link.connect_timeout, connector.connect(address)).await {
            Ok(result) => result?,
            Err(_) => return Err(LinkError::timeout(address, link.connect_timeout)),
        };
        Ok(Self::from_transport(address, transport, link.read_wait))
    }

    pub fn from_transport(address: &str, transport: T, read_wait: Duration) -> Self {
        Self {
            address: address.to_string(),
            transport: Some(transport),
            assembler: FrameAssembler::new(),
            read_wait,
        }
    }

    pub const fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    fn transport(&mut self) -> Result<&mut T, LinkError> {
        self.transport
            .as_mut()
            .ok_or_else(|| LinkError::disconnected(self.address.clone(), "session closed"))
    }

    /// Send a read request
    pub async fn request(&mut self, command: Command) -> Result<(), LinkError> {
        let frame = command.request();
        tracing::trace!("{} TX {}", self.address, hex::encode(frame));
        self.transport()?.write(&frame).await
    }

    /// Return at most one decoded frame.
    ///
    /// Frames already buffered are returned first; otherwise one chunk is
    /// read, waiting no longer than the configured read wait.
    pub async fn poll(&mut self) -> Result<Option<Frame>, PollError> {
        if let Some(result) = self.assembler.next_frame() {
            return Ok(Some(result?));
        }
        let wait = self.read_wait;
        let chunk = self.transport()?.read_chunk(wait).await?;
        if let Some(chunk) = chunk {
            tracing::trace!("{} RX {}", self.address, hex::encode(&chunk));
            self.assembler.push(&chunk);
        }
        match self.assembler.next_frame() {
            Some(result) => Ok(Some(result?)),
            None => Ok(None),
        }
    }

    /// Close the session; later calls do nothing
    pub async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.assembler.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_response;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Scripted {
        chunks: VecDeque<Vec<u8>>,
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<Mutex<u32>>,
    }

    #[async_trait::async_trait]
    impl Transport for Scripted {
        async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError> {
            self.written.lock().unwrap().push(frame.to_vec());
            Ok(())
        }

        async fn read_chunk(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, LinkError> {
            match self.chunks.pop_front() {
                Some(c) => Ok(Some(c)),
                None => {
                    tokio::time::sleep(wait).await;
                    Ok(None)
                }
            }
        }

        async fn close(&mut self) {
            *self.closed.lock().unwrap() += 1;
        }
    }

    /// Hangs mid-connect; counts how often a half-open attempt was released
    #[derive(Default)]
    struct NeverConnects {
        released: Arc<Mutex<u32>>,
    }

    struct Release(Arc<Mutex<u32>>);

    impl Drop for Release {
        fn drop(&mut self) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[async_trait::async_trait]
    impl Connector for NeverConnects {
        type Transport = Scripted;

        async fn connect(&self, _address: &str) -> Result<Scripted, LinkError> {
            let _release = Release(self.released.clone());
            std::future::pending().await
        }
    }

    fn link_settings() -> LinkSettings {
        LinkSettings {
            request_interval: Duration::from_secs(5),
            read_wait: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(15),
            max_consecutive_frame_errors: 5,
            reconnect_attempts: Some(3),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(8),
            stale_after: Duration::from_secs(15),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_and_releases_the_attempt() {
        let connector = NeverConnects::default();
        let err = LinkHandle::connect(&connector, "AA", &link_settings())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LinkError::Timeout { millis: 15000, .. }));
        assert_eq!(*connector.released.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_reassembles_and_disconnect_is_idempotent() {
        let frame = encode_response(0x04, 0, &[0x0c, 0xe4, 0x0c, 0xe5]);
        let transport = Scripted {
            chunks: VecDeque::from(vec![frame[..3].to_vec(), frame[3..].to_vec()]),
            ..Scripted::default()
        };
        let written = transport.written.clone();
        let closed = transport.closed.clone();
        let mut handle = LinkHandle::from_transport("AA", transport, Duration::from_millis(250));

        handle.request(Command::CellVoltages).await.unwrap();
        assert_eq!(written.lock().unwrap()[0], Command::CellVoltages.request().to_vec());

        assert_eq!(handle.poll().await.unwrap(), None);
        assert!(matches!(handle.poll().await.unwrap(), Some(Frame::CellVoltages(_))));
        assert_eq!(handle.poll().await.unwrap(), None);

        handle.disconnect().await;
        handle.disconnect().await;
        assert_eq!(*closed.lock().unwrap(), 1);
        assert!(!handle.is_connected());
        assert!(matches!(handle.poll().await, Err(PollError::Link(_))));
    }
}
