//! Camera-stream collaborator: decoded frames plus connection events.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homesight_types::{HomeError, SessionId, StreamSource};

/// One decoded frame handed over by a stream reader.
#[derive(Clone)]
pub struct CameraFrame {
    /// Sequence number assigned by the reader; may wrap or arrive out of order.
    pub source_sequence: u64,
    pub captured_at: DateTime<Utc>,
    /// Frame width in pixels (0 when unknown).
    pub width: u32,
    /// Frame height in pixels (0 when unknown).
    pub height: u32,
    /// Encoded frame bytes, shared rather than copied.
    pub data: Arc<[u8]>,
}

impl CameraFrame {
    pub fn new(source_sequence: u64, width: u32, height: u32, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            source_sequence,
            captured_at: Utc::now(),
            width,
            height,
            data: data.into(),
        }
    }
}

impl std::fmt::Debug for CameraFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraFrame")
            .field("source_sequence", &self.source_sequence)
            .field("captured_at", &self.captured_at)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// What a stream reader reports.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Frame(CameraFrame),
    /// The stream dropped; the reader keeps trying to reconnect.
    Disconnected { reason: String },
    /// The stream is back after a [`StreamEvent::Disconnected`].
    Reconnected,
}

/// A live, open stream for one camera.
#[async_trait]
pub trait CameraStream: Send {
    /// Wait for the next event. `None` means the stream ended for good.
    async fn next_event(&mut self) -> Option<StreamEvent>;
}

/// Opens streams for stream sources handed out by the media relay.
#[async_trait]
pub trait CameraSource: Send + Sync {
    /// Open the stream behind `source` on behalf of `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`HomeError::Stream`] when the source cannot be opened at all.
    async fn open(
        &self,
        session_id: &SessionId,
        source: &StreamSource,
    ) -> Result<Box<dyn CameraStream>, HomeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedStream {
        events: Vec<StreamEvent>,
    }

    #[async_trait]
    impl CameraStream for ScriptedStream {
        async fn next_event(&mut self) -> Option<StreamEvent> {
            if self.events.is_empty() {
                None
            } else {
                Some(self.events.remove(0))
            }
        }
    }

    #[tokio::test]
    async fn scripted_stream_yields_events_then_ends() {
        let mut stream = ScriptedStream {
            events: vec![
                StreamEvent::Frame(CameraFrame::new(1, 2, 2, vec![0u8; 12])),
                StreamEvent::Disconnected {
                    reason: "relay restarted".into(),
                },
                StreamEvent::Reconnected,
            ],
        };
        assert!(matches!(stream.next_event().await, Some(StreamEvent::Frame(f)) if f.source_sequence == 1));
        assert!(matches!(
            stream.next_event().await,
            Some(StreamEvent::Disconnected { .. })
        ));
        assert!(matches!(stream.next_event().await, Some(StreamEvent::Reconnected)));
        assert!(stream.next_event().await.is_none());
    }

    #[test]
    fn frame_debug_reports_length_only() {
        let frame = CameraFrame::new(3, 4, 4, vec![9u8; 48]);
        let debug = format!("{frame:?}");
        assert!(debug.contains("data_len: 48"));
        assert!(debug.contains("4x4"));
    }
}
