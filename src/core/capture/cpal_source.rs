//! Microphone input through cpal.
//!
//! cpal streams are not `Send`, so each open stream lives on its own thread
//! until `close()` signals it.

use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::{AudioSource, CaptureConstraints, CaptureError, SourceEvent};
use crate::core::codec;

/// Samples buffered between the device callback and the pipeline.
const SOURCE_CHANNEL_CAPACITY: usize = 64;

struct Running {
    stop: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

/// The system microphone.
pub struct CpalSource {
    device_name: Option<String>,
    running: Mutex<Option<Running>>,
}

impl CpalSource {
    /// Use the default input device.
    pub fn new() -> Self {
        Self {
            device_name: None,
            running: Mutex::new(None),
        }
    }

    /// Use the input device with this exact name.
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
            running: Mutex::new(None),
        }
    }
}

impl Default for CpalSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioSource for CpalSource {
    async fn open(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<mpsc::Receiver<SourceEvent>, CaptureError> {
        self.close().await;

        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), CaptureError>>();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (events_tx, events_rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);

        let constraints = constraints.clone();
        let device_name = self.device_name.clone();
        let thread = std::thread::Builder::new()
            .name("learnie-capture".to_string())
            .spawn(move || {
                let stream = match build_stream(device_name.as_deref(), &constraints, events_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(map_error(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.blocking_recv();
                drop(stream);
            })
            .map_err(|e| CaptureError::Device(format!("Failed to spawn capture thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                *self.running.lock() = Some(Running {
                    stop: stop_tx,
                    thread,
                });
                Ok(events_rx)
            }
            Ok(Err(e)) => {
                let _ = tokio::task::spawn_blocking(move || thread.join()).await;
                Err(e)
            }
            Err(_) => Err(CaptureError::Device("capture thread exited".to_string())),
        }
    }

    async fn close(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.stop.send(());
            let _ = tokio::task::spawn_blocking(move || running.thread.join()).await;
            tracing::debug!("Microphone released");
        }
    }
}

fn build_stream(
    device_name: Option<&str>,
    constraints: &CaptureConstraints,
    events: mpsc::Sender<SourceEvent>,
) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| map_error(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false)),
        None => host.default_input_device(),
    }
    .ok_or_else(|| CaptureError::Device("No input device available".to_string()))?;

    tracing::info!(
        "Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );
    if constraints.echo_cancellation || constraints.noise_suppression || constraints.auto_gain {
        tracing::debug!("Echo cancellation, noise suppression and gain are left to the platform");
    }

    let rate = SampleRate(constraints.sample_rate);
    let range = device
        .supported_input_configs()
        .map_err(|e| map_error(e.to_string()))?
        .filter(|r| r.min_sample_rate() <= rate && r.max_sample_rate() >= rate)
        .filter(|r| matches!(r.sample_format(), SampleFormat::F32 | SampleFormat::I16))
        .min_by_key(|r| (r.channels(), r.sample_format() != SampleFormat::F32))
        .ok_or_else(|| {
            CaptureError::Device(format!(
                "No input configuration at {} Hz",
                constraints.sample_rate
            ))
        })?;

    let format = range.sample_format();
    let config = range.with_sample_rate(rate).config();
    let channels = config.channels;

    let lost = events.clone();
    let err_fn = move |err: cpal::StreamError| {
        tracing::error!("Audio input stream error: {}", err);
        let _ = lost.try_send(SourceEvent::DeviceLost(err.to_string()));
    };

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                forward(&events, codec::downmix_to_mono(data, channels));
            },
            err_fn,
            None,
        ),
        _ => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| codec::i16_to_sample(s)).collect();
                forward(&events, codec::downmix_to_mono(&samples, channels));
            },
            err_fn,
            None,
        ),
    }
    .map_err(|e| map_error(e.to_string()))?;

    Ok(stream)
}

fn forward(events: &mpsc::Sender<SourceEvent>, samples: Vec<f32>) {
    if let Err(e) = events.try_send(SourceEvent::Samples(samples)) {
        tracing::debug!("Dropping capture samples: {}", e);
    }
}

fn map_error(message: String) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        CaptureError::PermissionDenied(message)
    } else {
        CaptureError::Device(message)
    }
}
