//! Ordered playback of streamed assistant audio.
//!
//! [`PlaybackQueue`] accepts chunks as they arrive and plays them one at a
//! time, strictly FIFO, through an [`AudioSink`]. A chunk that fails to
//! decode is skipped. When the queue runs dry, or on [`PlaybackQueue::stop`],
//! the speaking callback is told that speech ended.

#[cfg(feature = "audio-io")]
mod rodio_sink;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::codec;

#[cfg(feature = "audio-io")]
pub use rodio_sink::RodioSink;

/// Errors raised by playback.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlaybackError {
    #[error("Audio output error: {0}")]
    Device(String),

    #[error("Failed to decode audio: {0}")]
    Decode(String),

    #[error("Playback not supported: {0}")]
    Unsupported(String),
}

/// An audio output.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play mono samples, returning once they have finished playing.
    async fn play(&self, samples: Vec<f32>, sample_rate: u32) -> Result<(), PlaybackError>;

    /// Cut off whatever is playing now.
    fn halt(&self);

    /// Decode and play a complete compressed clip (MP3 or WAV).
    async fn play_clip(&self, _bytes: Bytes) -> Result<(), PlaybackError> {
        Err(PlaybackError::Unsupported(
            "this output cannot decode compressed audio".to_string(),
        ))
    }
}

/// One queued piece of audio.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackItem {
    /// Base64 PCM16 as carried in `response.audio.delta`
    Base64(String),
    /// Raw PCM16 little-endian
    Pcm16(Bytes),
    /// Already-decoded samples
    Samples(Vec<f32>),
}

impl PlaybackItem {
    fn decode(self) -> Result<Vec<f32>, PlaybackError> {
        match self {
            PlaybackItem::Base64(text) => {
                codec::decode_base64(&text).map_err(|e| PlaybackError::Decode(e.to_string()))
            }
            PlaybackItem::Pcm16(bytes) => {
                if bytes.len() % codec::BYTES_PER_SAMPLE != 0 {
                    return Err(PlaybackError::Decode(format!(
                        "odd PCM16 length {}",
                        bytes.len()
                    )));
                }
                Ok(codec::decode(&bytes))
            }
            PlaybackItem::Samples(samples) => Ok(samples),
        }
    }
}

/// Called with `true` when playback starts and `false` when it ends.
pub type SpeakingCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct QueueState {
    queue: VecDeque<PlaybackItem>,
    playing: bool,
    generation: u64,
    cancel: CancellationToken,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    speaking: Mutex<Option<SpeakingCallback>>,
}

impl Shared {
    fn notify_speaking(&self, speaking: bool) {
        let cb = self.speaking.lock().clone();
        if let Some(cb) = cb {
            cb(speaking);
        }
    }
}

/// FIFO audio playback with at most one chunk playing at a time.
pub struct PlaybackQueue {
    sink: Arc<dyn AudioSink>,
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl PlaybackQueue {
    /// Create the queue and its worker. Must be called inside a Tokio runtime.
    pub fn new(sink: Arc<dyn AudioSink>, sample_rate: u32) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                playing: false,
                generation: 0,
                cancel: CancellationToken::new(),
            }),
            notify: Notify::new(),
            speaking: Mutex::new(None),
        });
        let worker = tokio::spawn(run_worker(shared.clone(), sink.clone(), sample_rate));
        Self {
            sink,
            shared,
            worker,
        }
    }

    pub fn on_speaking_change(&self, callback: SpeakingCallback) {
        *self.shared.speaking.lock() = Some(callback);
    }

    /// Queue a chunk behind anything already pending.
    pub fn enqueue(&self, item: PlaybackItem) {
        let started = {
            let mut state = self.shared.state.lock();
            let started = !state.playing;
            state.playing = true;
            state.queue.push_back(item);
            started
        };
        if started {
            self.shared.notify_speaking(true);
        }
        self.shared.notify.notify_one();
    }

    /// Halt playback, drop everything queued and report that speech ended.
    pub fn stop(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            let dropped = state.queue.len();
            state.queue.clear();
            state.playing = false;
            state.cancel.cancel();
            state.cancel = CancellationToken::new();
            dropped
        };
        self.sink.halt();
        if dropped > 0 {
            tracing::debug!("Playback stopped, {} queued chunks dropped", dropped);
        }
        self.shared.notify_speaking(false);
    }

    /// Something is playing or queued.
    pub fn is_speaking(&self) -> bool {
        self.shared.state.lock().playing
    }

    /// Chunks waiting behind the one playing.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Play one compressed clip outside the queue.
    pub async fn play_clip(&self, bytes: Bytes) -> Result<(), PlaybackError> {
        self.sink.play_clip(bytes).await
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.shared.state.lock().cancel.cancel();
        self.worker.abort();
    }
}

async fn run_worker(shared: Arc<Shared>, sink: Arc<dyn AudioSink>, sample_rate: u32) {
    loop {
        let next = {
            let mut state = shared.state.lock();
            state
                .queue
                .pop_front()
                .map(|item| (item, state.generation, state.cancel.clone()))
        };

        let Some((item, generation, cancel)) = next else {
            shared.notify.notified().await;
            continue;
        };

        match item.decode() {
            Ok(samples) if samples.is_empty() => {}
            Ok(samples) => {
                tokio::select! {
                    result = sink.play(samples, sample_rate) => {
                        if let Err(e) = result {
                            tracing::warn!("Playback of chunk failed: {}", e);
                        }
                    }
                    _ = cancel.cancelled() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Skipping malformed audio chunk: {}", e);
            }
        }

        let drained = {
            let mut state = shared.state.lock();
            if state.generation != generation {
                // stop() already reported the end
                false
            } else if state.queue.is_empty() {
                state.playing = false;
                true
            } else {
                false
            }
        };
        if drained {
            shared.notify_speaking(false);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::time::Duration;

    /// Sink that records what it played, identified by the first sample.
    #[derive(Default)]
    pub struct RecordingSink {
        pub played: Mutex<Vec<Vec<f32>>>,
        pub started: Mutex<Vec<f32>>,
        pub halts: std::sync::atomic::AtomicU32,
        /// Per-chunk playback time keyed by first sample
        pub delays: Mutex<Vec<(f32, Duration)>>,
        pub default_delay: Duration,
    }

    impl RecordingSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                default_delay: delay,
                ..Default::default()
            })
        }

        pub fn played_ids(&self) -> Vec<f32> {
            self.played.lock().iter().map(|s| s[0]).collect()
        }
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, samples: Vec<f32>, _sample_rate: u32) -> Result<(), PlaybackError> {
            let id = samples[0];
            self.started.lock().push(id);
            let delay = self
                .delays
                .lock()
                .iter()
                .find(|(key, _)| *key == id)
                .map(|(_, d)| *d)
                .unwrap_or(self.default_delay);
            tokio::time::sleep(delay).await;
            self.played.lock().push(samples);
            Ok(())
        }

        fn halt(&self) {
            self.halts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use std::time::Duration;

    fn chunk(id: f32) -> PlaybackItem {
        PlaybackItem::Base64(codec::encode_base64(&[id; 480]))
    }

    fn id_of(step: i16) -> f32 {
        codec::i16_to_sample(codec::sample_to_i16(step as f32 / 10.0))
    }

    fn speaking_log(queue: &PlaybackQueue) -> Arc<Mutex<Vec<bool>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        queue.on_speaking_change(Arc::new(move |speaking| sink.lock().push(speaking)));
        log
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_in_arrival_order_when_first_is_slow() {
        let sink = RecordingSink::with_delay(Duration::from_millis(10));
        sink.delays
            .lock()
            .push((id_of(1), Duration::from_millis(500)));
        let queue = PlaybackQueue::new(sink.clone(), 24000);

        queue.enqueue(PlaybackItem::Samples(vec![id_of(1); 10]));
        queue.enqueue(PlaybackItem::Samples(vec![id_of(2); 10]));
        queue.enqueue(PlaybackItem::Samples(vec![id_of(3); 10]));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.played_ids(), vec![id_of(1), id_of(2), id_of(3)]);
        // Never more than one chunk in flight
        assert_eq!(*sink.started.lock(), vec![id_of(1), id_of(2), id_of(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_transitions() {
        let sink = RecordingSink::with_delay(Duration::from_millis(50));
        let queue = PlaybackQueue::new(sink.clone(), 24000);
        let log = speaking_log(&queue);

        queue.enqueue(chunk(0.5));
        queue.enqueue(chunk(0.25));
        assert!(queue.is_speaking());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!queue.is_speaking());
        assert_eq!(*log.lock(), vec![true, false]);
        assert_eq!(sink.played.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_chunk_skipped() {
        let sink = RecordingSink::new();
        let queue = PlaybackQueue::new(sink.clone(), 24000);

        queue.enqueue(chunk(0.5));
        queue.enqueue(PlaybackItem::Base64("%%% not base64".to_string()));
        queue.enqueue(PlaybackItem::Pcm16(Bytes::from_static(&[1, 2, 3])));
        queue.enqueue(chunk(0.25));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.played.lock().len(), 2);
        assert!(!queue.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_queue_and_reports_end() {
        let sink = RecordingSink::with_delay(Duration::from_secs(1));
        let queue = PlaybackQueue::new(sink.clone(), 24000);
        let log = speaking_log(&queue);

        queue.enqueue(chunk(0.5));
        queue.enqueue(chunk(0.25));
        queue.enqueue(chunk(0.125));
        tokio::time::sleep(Duration::from_millis(100)).await;

        queue.stop();
        assert!(!queue.is_speaking());
        assert_eq!(queue.queued(), 0);
        assert_eq!(sink.halts.load(std::sync::atomic::Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        // The interrupted chunk never completes and nothing after it starts
        assert!(sink.played.lock().is_empty());
        assert_eq!(sink.started.lock().len(), 1);
        assert_eq!(*log.lock(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_after_stop_plays() {
        let sink = RecordingSink::new();
        let queue = PlaybackQueue::new(sink.clone(), 24000);

        queue.enqueue(chunk(0.5));
        queue.stop();
        queue.enqueue(chunk(0.25));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(sink.played_ids(), vec![0.25]);
    }

    #[tokio::test]
    async fn test_clip_unsupported_by_default() {
        let queue = PlaybackQueue::new(RecordingSink::new(), 24000);
        assert!(matches!(
            queue.play_clip(Bytes::from_static(b"ID3")).await,
            Err(PlaybackError::Unsupported(_))
        ));
    }
}
