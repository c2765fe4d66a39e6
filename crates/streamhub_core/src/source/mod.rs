//! Change source port.
//!
//! A [`ChangeSource`] owns the single connection to the shared store and
//! hands out one [`ChangeStream`] per watched collection. Every stream
//! multiplexes over that connection. The hub never touches the connection
//! directly; it only calls the methods below.

mod memory;

pub use memory::MemoryChangeSource;

use crate::error::HubResult;
use crate::event::ResumeToken;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Options passed to [`ChangeSource::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Connection pool size to request.
    pub max_connections: u32,
    /// Buffered raw changes per opened stream.
    pub stream_buffer: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            max_connections: 1,
            stream_buffer: 1024,
        }
    }
}

/// A store-native change event.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    /// Position of this change; resuming from it yields the next change.
    pub token: ResumeToken,
    /// Change document in the store's wire shape.
    pub document: Value,
}

/// Sending half of a [`ChangeStream`], held by source implementations.
pub type ChangeSender = mpsc::Sender<HubResult<RawChange>>;

/// Stream of raw changes for one collection, in commit order.
///
/// The stream yields `Err(HubError::ConnectionLost)` or ends when the
/// underlying connection goes away.
#[derive(Debug)]
pub struct ChangeStream {
    collection: String,
    receiver: mpsc::Receiver<HubResult<RawChange>>,
    gap_free: bool,
    start: Option<ResumeToken>,
}

impl ChangeStream {
    /// Creates a stream and the sender that feeds it.
    pub fn channel(
        collection: impl Into<String>,
        buffer: usize,
        gap_free: bool,
    ) -> (ChangeSender, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let stream = Self {
            collection: collection.into(),
            receiver: rx,
            gap_free,
            start: None,
        };
        (tx, stream)
    }

    /// Records the position the stream begins after.
    #[must_use]
    pub fn with_start(mut self, token: ResumeToken) -> Self {
        self.start = Some(token);
        self
    }

    /// Position the stream begins after. Reopening from this token misses
    /// nothing the stream would have delivered, even if no change arrived
    /// before the connection was lost.
    pub fn start_token(&self) -> Option<ResumeToken> {
        self.start
    }

    /// Waits for the next change. `None` means the stream ended.
    pub async fn next(&mut self) -> Option<HubResult<RawChange>> {
        self.receiver.recv().await
    }

    /// Collection this stream watches.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// False when the source resumed from an earlier position than
    /// requested and may replay changes that were already delivered.
    pub fn is_gap_free(&self) -> bool {
        self.gap_free
    }
}

/// Access to the shared store's change notifications.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Establishes the shared connection.
    async fn connect(&self, options: &ConnectOptions) -> HubResult<()>;

    /// Opens a change stream on a collection.
    ///
    /// `from` must be a token issued by this source's current generation;
    /// otherwise the call fails with `HubError::InvalidResumeToken`.
    /// Sources should report the stream's starting position through
    /// [`ChangeStream::with_start`] so a watch that has not delivered
    /// anything yet can still resume without a gap.
    async fn open_watch(
        &self,
        collection: &str,
        from: Option<&ResumeToken>,
    ) -> HubResult<ChangeStream>;

    /// Releases the connection. Open streams end.
    async fn disconnect(&self) -> HubResult<()>;

    /// Checks if the connection is established.
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HubError;

    #[tokio::test]
    async fn stream_yields_in_send_order() {
        let (tx, mut stream) = ChangeStream::channel("rooms", 4, true);
        for position in 1..=3 {
            tx.send(Ok(RawChange {
                token: ResumeToken::new(0, position),
                document: Value::Null,
            }))
            .await
            .unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(item) = stream.next().await {
            seen.push(item.unwrap().token.position());
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(stream.collection(), "rooms");
        assert!(stream.is_gap_free());
    }

    #[tokio::test]
    async fn stream_surfaces_connection_loss() {
        let (tx, mut stream) = ChangeStream::channel("users", 1, false);
        tx.send(Err(HubError::connection_lost("reset"))).await.unwrap();

        assert!(matches!(
            stream.next().await,
            Some(Err(HubError::ConnectionLost(_)))
        ));
        assert!(!stream.is_gap_free());
    }
}
