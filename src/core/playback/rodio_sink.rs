//! Speaker output through rodio.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink, Source};
use tokio::sync::oneshot;

use super::{AudioSink, PlaybackError};

/// Default output device. The `OutputStream` is not `Send` and stays on a
/// dedicated thread for the life of the sink.
pub struct RodioSink {
    sink: Arc<Sink>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl RodioSink {
    pub async fn open() -> Result<Self, PlaybackError> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<Arc<Sink>, PlaybackError>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        std::thread::Builder::new()
            .name("learnie-playback".to_string())
            .spawn(move || {
                let (stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(PlaybackError::Device(e.to_string())));
                        return;
                    }
                };
                match Sink::try_new(&handle) {
                    Ok(sink) => {
                        let _ = ready_tx.send(Ok(Arc::new(sink)));
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(PlaybackError::Device(e.to_string())));
                        return;
                    }
                }
                let _ = shutdown_rx.blocking_recv();
                drop(stream);
            })
            .map_err(|e| PlaybackError::Device(format!("Failed to spawn playback thread: {}", e)))?;

        let sink = ready_rx
            .await
            .map_err(|_| PlaybackError::Device("playback thread exited".to_string()))??;
        tracing::info!("Speaker output ready");

        Ok(Self {
            sink,
            shutdown: Mutex::new(Some(shutdown_tx)),
        })
    }

    async fn wait_until_end(&self) -> Result<(), PlaybackError> {
        let sink = self.sink.clone();
        tokio::task::spawn_blocking(move || sink.sleep_until_end())
            .await
            .map_err(|e| PlaybackError::Device(e.to_string()))
    }
}

#[async_trait]
impl AudioSink for RodioSink {
    async fn play(&self, samples: Vec<f32>, sample_rate: u32) -> Result<(), PlaybackError> {
        self.sink.append(SamplesBuffer::new(1, sample_rate, samples));
        self.wait_until_end().await
    }

    fn halt(&self) {
        self.sink.stop();
    }

    async fn play_clip(&self, bytes: Bytes) -> Result<(), PlaybackError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let source = rodio::Decoder::new(Cursor::new(bytes.to_vec()))
            .map_err(|e| PlaybackError::Decode(e.to_string()))?;
        self.sink.append(source.convert_samples::<f32>());
        self.wait_until_end().await
    }
}

impl Drop for RodioSink {
    fn drop(&mut self) {
        self.sink.stop();
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
    }
}
