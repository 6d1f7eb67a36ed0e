//! Microphone capture pipeline.
//!
//! An [`AudioSource`] delivers raw mono samples; [`CapturePipeline`]
//! re-blocks them to a fixed size, runs silence detection, encodes each
//! block to PCM16 and hands it to the registered chunk callback.
//!
//! Callbacks run on the pipeline's worker as each block completes, with no
//! queue in between. After [`CapturePipeline::stop`] returns no callback
//! fires again.

mod silence;

#[cfg(feature = "audio-io")]
mod cpal_source;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::codec::EncodedChunk;

pub use silence::{DEFAULT_SILENCE_DURATION, DEFAULT_SILENCE_THRESHOLD, SilenceDetector};

#[cfg(feature = "audio-io")]
pub use cpal_source::CpalSource;

/// Default samples per processing block.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Errors raised by capture.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CaptureError {
    /// The user or platform refused microphone access
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No usable input device
    #[error("Audio device error: {0}")]
    Device(String),

    /// The device went away while capturing
    #[error("Audio device lost: {0}")]
    DeviceLost(String),

    /// Capture was stopped before the device opened
    #[error("Capture stopped")]
    Closed,
}

impl CaptureError {
    /// Permission and device errors need user action, not a retry.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// Requested microphone properties.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain: bool,
}

impl CaptureConstraints {
    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain: true,
        }
    }
}

/// What an open source produces.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// Mono samples in [-1, 1], any length
    Samples(Vec<f32>),
    /// The device failed mid-stream
    DeviceLost(String),
}

/// A live microphone.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Acquire the device and start streaming samples.
    async fn open(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<mpsc::Receiver<SourceEvent>, CaptureError>;

    /// Release the device. Idempotent.
    async fn close(&self);
}

/// Capture tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    pub sample_rate: u32,
    pub block_size: usize,
    pub silence_threshold: f32,
    pub silence_duration: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            block_size: DEFAULT_BLOCK_SIZE,
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            silence_duration: DEFAULT_SILENCE_DURATION,
        }
    }
}

/// Called with each encoded block.
pub type ChunkCallback = Arc<dyn Fn(EncodedChunk) + Send + Sync>;

/// Called once per continuous silent span.
pub type SilenceCallback = Arc<dyn Fn() + Send + Sync>;

/// Called when capture ends because of a device failure.
pub type CaptureErrorCallback = Arc<dyn Fn(CaptureError) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    chunk: Option<ChunkCallback>,
    silence: Option<SilenceCallback>,
    error: Option<CaptureErrorCallback>,
}

struct Control {
    generation: u64,
    active: bool,
    paused: bool,
    detector: SilenceDetector,
}

struct Inner {
    /// Held while callbacks run so `stop()` can wait out a block in flight.
    control: Mutex<Control>,
    callbacks: Mutex<Callbacks>,
}

/// Turns a live [`AudioSource`] into a sequence of [`EncodedChunk`]s.
pub struct CapturePipeline {
    source: Arc<dyn AudioSource>,
    settings: CaptureSettings,
    inner: Arc<Inner>,
    worker: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl CapturePipeline {
    pub fn new(source: Arc<dyn AudioSource>, settings: CaptureSettings) -> Self {
        let detector = SilenceDetector::new(
            settings.silence_threshold,
            settings.silence_duration,
            settings.sample_rate,
        );
        Self {
            source,
            settings,
            inner: Arc::new(Inner {
                control: Mutex::new(Control {
                    generation: 0,
                    active: false,
                    paused: false,
                    detector,
                }),
                callbacks: Mutex::new(Callbacks::default()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn on_chunk(&self, callback: ChunkCallback) {
        self.inner.callbacks.lock().chunk = Some(callback);
    }

    pub fn on_silence(&self, callback: SilenceCallback) {
        self.inner.callbacks.lock().silence = Some(callback);
    }

    pub fn on_error(&self, callback: CaptureErrorCallback) {
        self.inner.callbacks.lock().error = Some(callback);
    }

    pub fn is_active(&self) -> bool {
        self.inner.control.lock().active
    }

    pub fn is_paused(&self) -> bool {
        self.inner.control.lock().paused
    }

    /// Acquire the microphone and start delivering blocks.
    ///
    /// Returns [`CaptureError::Closed`] if `stop()` was called while the
    /// device was being acquired; the device is released in that case.
    pub async fn start(&self) -> Result<(), CaptureError> {
        let generation = {
            let mut control = self.inner.control.lock();
            if control.active {
                return Ok(());
            }
            control.generation += 1;
            control.generation
        };

        let constraints = CaptureConstraints::mono(self.settings.sample_rate);
        let events = self.source.open(&constraints).await?;

        let stale = {
            let mut control = self.inner.control.lock();
            if control.generation == generation {
                control.active = true;
                control.paused = false;
                control.detector.reset();
                false
            } else {
                true
            }
        };
        if stale {
            tracing::debug!("Capture stopped during device acquisition");
            self.source.close().await;
            return Err(CaptureError::Closed);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_worker(
            self.inner.clone(),
            self.source.clone(),
            events,
            generation,
            self.settings.block_size.max(1),
            self.settings.sample_rate,
            cancel.clone(),
        ));
        if let Some((old, old_cancel)) = self.worker.lock().replace((handle, cancel)) {
            old_cancel.cancel();
            old.abort();
        }

        tracing::info!(
            "Capture started at {} Hz, {} samples per block",
            self.settings.sample_rate,
            self.settings.block_size
        );
        Ok(())
    }

    /// Release the device. Idempotent; no callback fires after this returns.
    pub async fn stop(&self) {
        let was_active = {
            let mut control = self.inner.control.lock();
            control.generation += 1;
            let was_active = control.active;
            control.active = false;
            control.paused = false;
            control.detector.reset();
            was_active
        };

        if let Some((handle, cancel)) = self.worker.lock().take() {
            cancel.cancel();
            handle.abort();
        }

        if was_active {
            self.source.close().await;
            tracing::info!("Capture stopped");
        }
    }

    /// Discard blocks without releasing the device.
    ///
    /// Used while the assistant is speaking so its own voice is not sent
    /// back. Silence tracking restarts when capture resumes.
    pub fn set_paused(&self, paused: bool) {
        let mut control = self.inner.control.lock();
        if control.paused != paused {
            control.paused = paused;
            control.detector.reset();
            tracing::debug!("Capture {}", if paused { "paused" } else { "resumed" });
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if let Some((handle, cancel)) = self.worker.lock().take() {
            cancel.cancel();
            handle.abort();
        }
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    source: Arc<dyn AudioSource>,
    mut events: mpsc::Receiver<SourceEvent>,
    generation: u64,
    block_size: usize,
    sample_rate: u32,
    cancel: CancellationToken,
) {
    let mut pending: Vec<f32> = Vec::with_capacity(block_size * 2);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };

        match event {
            Some(SourceEvent::Samples(samples)) => {
                pending.extend_from_slice(&samples);
                while pending.len() >= block_size {
                    let block: Vec<f32> = pending.drain(..block_size).collect();
                    if !deliver_block(&inner, generation, &block, sample_rate) {
                        return;
                    }
                }
            }
            Some(SourceEvent::DeviceLost(reason)) => {
                end_with_device_loss(&inner, &source, generation, reason).await;
                return;
            }
            None => {
                end_with_device_loss(&inner, &source, generation, "stream ended".to_string())
                    .await;
                return;
            }
        }
    }
}

/// Run callbacks for one block. Returns `false` once capture is no longer
/// wanted.
fn deliver_block(inner: &Inner, generation: u64, block: &[f32], sample_rate: u32) -> bool {
    let mut control = inner.control.lock();
    if control.generation != generation || !control.active {
        return false;
    }
    if control.paused {
        return true;
    }

    let silent = control.detector.process(block);
    let (chunk_cb, silence_cb) = {
        let callbacks = inner.callbacks.lock();
        (callbacks.chunk.clone(), callbacks.silence.clone())
    };

    // Chunk first so the block that completes the silence is sent before
    // anyone reacts to the silence
    if let Some(cb) = chunk_cb {
        cb(EncodedChunk::from_samples(block, sample_rate));
    }
    if silent {
        tracing::debug!("Silence detected");
        if let Some(cb) = silence_cb {
            cb();
        }
    }
    drop(control);
    true
}

async fn end_with_device_loss(
    inner: &Inner,
    source: &Arc<dyn AudioSource>,
    generation: u64,
    reason: String,
) {
    let error_cb = {
        let mut control = inner.control.lock();
        if control.generation != generation || !control.active {
            return;
        }
        control.active = false;
        inner.callbacks.lock().error.clone()
    };

    tracing::error!("Capture device lost: {}", reason);
    source.close().await;
    if let Some(cb) = error_cb {
        cb(CaptureError::DeviceLost(reason));
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ChannelSource;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> CaptureSettings {
        CaptureSettings {
            sample_rate: 16000,
            ..Default::default()
        }
    }

    struct Counters {
        chunks: Arc<Mutex<Vec<EncodedChunk>>>,
        silences: Arc<AtomicUsize>,
        errors: Arc<Mutex<Vec<CaptureError>>>,
    }

    fn wire(pipeline: &CapturePipeline) -> Counters {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let silences = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let chunks = chunks.clone();
            pipeline.on_chunk(Arc::new(move |chunk| chunks.lock().push(chunk)));
        }
        {
            let silences = silences.clone();
            pipeline.on_silence(Arc::new(move || {
                silences.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let errors = errors.clone();
            pipeline.on_error(Arc::new(move |err| errors.lock().push(err)));
        }
        Counters {
            chunks,
            silences,
            errors,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_reblocks_to_fixed_size() {
        let source = ChannelSource::new();
        let pipeline = CapturePipeline::new(source.clone(), settings());
        let counters = wire(&pipeline);

        pipeline.start().await.unwrap();
        assert!(source.push(vec![0.1; 3000]).await);
        assert!(source.push(vec![0.1; 6000]).await);
        settle().await;

        let chunks = counters.chunks.lock();
        // 9000 samples make two full blocks; the remainder waits
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.sample_count() == DEFAULT_BLOCK_SIZE));
        assert_eq!(chunks[0].sample_rate, 16000);
    }

    #[tokio::test]
    async fn test_silence_notified_once_per_span() {
        let source = ChannelSource::new();
        let pipeline = CapturePipeline::new(source.clone(), settings());
        let counters = wire(&pipeline);

        pipeline.start().await.unwrap();
        for _ in 0..12 {
            source.push(vec![0.0; DEFAULT_BLOCK_SIZE]).await;
        }
        settle().await;
        assert_eq!(counters.silences.load(Ordering::SeqCst), 1);
        assert_eq!(counters.chunks.lock().len(), 12);
    }

    #[tokio::test]
    async fn test_alternating_audio_never_silent() {
        let source = ChannelSource::new();
        let pipeline = CapturePipeline::new(source.clone(), settings());
        let counters = wire(&pipeline);

        pipeline.start().await.unwrap();
        for _ in 0..10 {
            source.push(vec![0.3; DEFAULT_BLOCK_SIZE]).await;
            source.push(vec![0.0; DEFAULT_BLOCK_SIZE]).await;
        }
        settle().await;
        assert_eq!(counters.silences.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_chunks_after_stop() {
        let source = ChannelSource::new();
        let pipeline = CapturePipeline::new(source.clone(), settings());
        let counters = wire(&pipeline);

        pipeline.start().await.unwrap();
        source.push(vec![0.2; DEFAULT_BLOCK_SIZE]).await;
        settle().await;
        pipeline.stop().await;
        pipeline.stop().await;

        assert!(!source.push(vec![0.2; DEFAULT_BLOCK_SIZE]).await);
        settle().await;
        assert_eq!(counters.chunks.lock().len(), 1);
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
        assert!(!pipeline.is_active());
    }

    #[tokio::test]
    async fn test_paused_blocks_are_discarded() {
        let source = ChannelSource::new();
        let pipeline = CapturePipeline::new(source.clone(), settings());
        let counters = wire(&pipeline);

        pipeline.start().await.unwrap();
        pipeline.set_paused(true);
        for _ in 0..12 {
            source.push(vec![0.0; DEFAULT_BLOCK_SIZE]).await;
        }
        settle().await;
        assert!(counters.chunks.lock().is_empty());
        assert_eq!(counters.silences.load(Ordering::SeqCst), 0);

        pipeline.set_paused(false);
        source.push(vec![0.2; DEFAULT_BLOCK_SIZE]).await;
        settle().await;
        assert_eq!(counters.chunks.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_surfaces() {
        let source = ChannelSource::new();
        *source.fail_with.lock() = Some(CaptureError::PermissionDenied("denied".into()));
        let pipeline = CapturePipeline::new(source.clone(), settings());

        let err = pipeline.start().await.unwrap_err();
        assert!(matches!(err, CaptureError::PermissionDenied(_)));
        assert!(!err.is_retryable());
        assert!(!pipeline.is_active());
    }

    #[tokio::test]
    async fn test_device_loss_ends_capture_with_error() {
        let source = ChannelSource::new();
        let pipeline = CapturePipeline::new(source.clone(), settings());
        let counters = wire(&pipeline);

        pipeline.start().await.unwrap();
        source.lose_device().await;
        settle().await;

        assert_eq!(
            counters.errors.lock().as_slice(),
            &[CaptureError::DeviceLost("unplugged".to_string())]
        );
        assert!(!pipeline.is_active());
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_during_device_acquisition_releases_device() {
        let source = ChannelSource::new();
        *source.open_delay.lock() = Some(std::time::Duration::from_millis(50));
        let pipeline = Arc::new(CapturePipeline::new(source.clone(), settings()));

        // Started from a spawned task, as the session controller does
        let starting = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.start().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        pipeline.stop().await;

        assert!(matches!(starting.await.unwrap(), Err(CaptureError::Closed)));
        assert!(!pipeline.is_active());
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let source = ChannelSource::new();
        let pipeline = CapturePipeline::new(source.clone(), settings());
        let counters = wire(&pipeline);

        pipeline.start().await.unwrap();
        pipeline.stop().await;
        pipeline.start().await.unwrap();
        source.push(vec![0.2; DEFAULT_BLOCK_SIZE]).await;
        settle().await;
        assert_eq!(counters.chunks.lock().len(), 1);
        assert_eq!(source.opens.load(Ordering::SeqCst), 2);
    }
}
