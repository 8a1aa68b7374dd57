//! [`SnapshotCamera`] – camera source backed by a media relay's HTTP
//! snapshot endpoint.
//!
//! The stream source URL is fetched once per poll interval; every successful
//! fetch is one frame. The first failure after a success reports
//! [`StreamEvent::Disconnected`]; the first success after a failure reports
//! [`StreamEvent::Reconnected`] followed by the frame. Payloads are passed
//! through undecoded, so frame dimensions are reported as zero.

use std::time::Duration;

use async_trait::async_trait;
use homesight_hal::{CameraFrame, CameraSource, CameraStream, StreamEvent};
use homesight_types::{HomeError, SessionId, StreamSource};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, warn};

pub struct SnapshotCamera {
    client: reqwest::Client,
    poll_interval: Duration,
    request_timeout: Duration,
}

impl SnapshotCamera {
    pub fn new(poll_interval: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), poll_interval)
    }

    pub fn with_client(client: reqwest::Client, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
            request_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl CameraSource for SnapshotCamera {
    /// Fetches one snapshot up front so an unreachable relay fails the open.
    async fn open(
        &self,
        session_id: &SessionId,
        source: &StreamSource,
    ) -> Result<Box<dyn CameraStream>, HomeError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stream = SnapshotStream {
            client: self.client.clone(),
            source: source.clone(),
            request_timeout: self.request_timeout,
            ticker,
            next_sequence: 1,
            connected: true,
            stashed: None,
        };
        // The first tick completes immediately.
        stream.ticker.tick().await;
        let first = stream.fetch().await.map_err(|details| HomeError::Stream {
            camera: source.camera_id.clone(),
            details,
        })?;
        stream.stashed = Some(first);
        debug!(session = %session_id, camera = %source.camera_id, url = %source.url, "snapshot stream opened");
        Ok(Box::new(stream))
    }
}

struct SnapshotStream {
    client: reqwest::Client,
    source: StreamSource,
    request_timeout: Duration,
    ticker: Interval,
    next_sequence: u64,
    connected: bool,
    stashed: Option<CameraFrame>,
}

impl SnapshotStream {
    async fn fetch(&mut self) -> Result<CameraFrame, String> {
        let bytes = self
            .client
            .get(&self.source.url)
            .timeout(self.request_timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| e.to_string())?
            .bytes()
            .await
            .map_err(|e| e.to_string())?;
        if bytes.is_empty() {
            return Err("empty snapshot".to_string());
        }
        let frame = CameraFrame::new(self.next_sequence, 0, 0, bytes.to_vec());
        self.next_sequence += 1;
        Ok(frame)
    }
}

#[async_trait]
impl CameraStream for SnapshotStream {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        if let Some(frame) = self.stashed.take() {
            return Some(StreamEvent::Frame(frame));
        }
        loop {
            self.ticker.tick().await;
            match self.fetch().await {
                Ok(frame) if self.connected => return Some(StreamEvent::Frame(frame)),
                Ok(frame) => {
                    self.connected = true;
                    self.stashed = Some(frame);
                    return Some(StreamEvent::Reconnected);
                }
                Err(reason) if self.connected => {
                    warn!(camera = %self.source.camera_id, %reason, "snapshot fetch failed");
                    self.connected = false;
                    return Some(StreamEvent::Disconnected { reason });
                }
                Err(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{client, serve};

    fn camera() -> SnapshotCamera {
        SnapshotCamera::with_client(client(), Duration::from_millis(10))
    }

    fn frame_data(event: Option<StreamEvent>) -> (u64, Vec<u8>) {
        match event {
            Some(StreamEvent::Frame(f)) => (f.source_sequence, f.data.to_vec()),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successive_snapshots_become_numbered_frames() {
        let (base, requests) = serve(vec![(200, "one".into()), (200, "two".into())]).await;
        let source = StreamSource::new("porch", format!("{base}/snapshot.jpg"));
        let mut stream = camera().open(&SessionId::new("porch"), &source).await.unwrap();

        assert_eq!(frame_data(stream.next_event().await), (1, b"one".to_vec()));
        assert_eq!(frame_data(stream.next_event().await), (2, b"two".to_vec()));
        assert!(requests.lock().unwrap()[0].starts_with("GET /snapshot.jpg"));
    }

    #[tokio::test]
    async fn failure_then_recovery_reports_disconnect_and_reconnect() {
        let (base, _) = serve(vec![
            (200, "one".into()),
            (503, String::new()),
            (503, String::new()),
            (200, "back".into()),
        ])
        .await;
        let source = StreamSource::new("porch", format!("{base}/snapshot.jpg"));
        let mut stream = camera().open(&SessionId::new("porch"), &source).await.unwrap();

        frame_data(stream.next_event().await);
        assert!(matches!(stream.next_event().await, Some(StreamEvent::Disconnected { .. })));
        assert!(matches!(stream.next_event().await, Some(StreamEvent::Reconnected)));
        assert_eq!(frame_data(stream.next_event().await), (2, b"back".to_vec()));
    }

    #[tokio::test]
    async fn unreachable_relay_fails_open() {
        let (base, _) = serve(vec![(404, String::new())]).await;
        let source = StreamSource::new("porch", format!("{base}/missing.jpg"));
        let err = camera()
            .open(&SessionId::new("porch"), &source)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HomeError::Stream { ref camera, .. } if camera == "porch"));
    }
}
