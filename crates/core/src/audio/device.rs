//! Live input through `cpal`.
//!
//! `cpal::Stream` is not `Send` on every host, so each opened device gets a
//! dedicated thread that owns the stream until the source is closed. The
//! input callback downmixes into a bounded ring the tick task reads from.

use std::{
    collections::VecDeque,
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, SampleFormat, Stream, StreamConfig,
};
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::{analysis::SpectrumAnalyser, config::AudioConfig, Result, TriggerRigError};

use super::{CaptureBackend, SpectrumSource};

type SampleRing = Arc<Mutex<VecDeque<f32>>>;

/// Captures from the host's input devices. `device_id` matches a device
/// name; without one the default input is used.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalBackend;

impl CaptureBackend for CpalBackend {
    fn open<'a>(
        &'a self,
        device_id: Option<&'a str>,
        audio: &'a AudioConfig,
    ) -> BoxFuture<'a, Result<Box<dyn SpectrumSource>>> {
        let device_id = device_id.map(str::to_owned);
        let fft_size = audio.fft_size;
        let smoothing = audio.smoothing_time_constant;

        Box::pin(async move {
            let ring: SampleRing = Arc::new(Mutex::new(VecDeque::with_capacity(fft_size)));
            let (ready_tx, ready_rx) = oneshot::channel();
            let (stop_tx, stop_rx) = mpsc::channel::<()>();

            let thread_ring = ring.clone();
            let thread = thread::Builder::new()
                .name("trigger-rig-capture".into())
                .spawn(move || stream_thread(device_id, thread_ring, fft_size, ready_tx, stop_rx))?;

            let mut source = DeviceSource {
                ring,
                analyser: None,
                sample_rate: 0,
                window: Vec::with_capacity(fft_size),
                stop: Some(stop_tx),
                thread: Some(thread),
            };

            let sample_rate = ready_rx
                .await
                .map_err(|_| TriggerRigError::capability("capture thread exited early"))??;
            source.sample_rate = sample_rate;
            source.analyser = Some(SpectrumAnalyser::new(sample_rate, fft_size, smoothing)?);
            Ok(Box::new(source) as Box<dyn SpectrumSource>)
        })
    }
}

struct DeviceSource {
    ring: SampleRing,
    analyser: Option<SpectrumAnalyser>,
    sample_rate: u32,
    window: Vec<f32>,
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SpectrumSource for DeviceSource {
    fn sample_rate(&self) -> f64 {
        f64::from(self.sample_rate)
    }

    fn fft_size(&self) -> usize {
        self.analyser.as_ref().map(SpectrumAnalyser::fft_size).unwrap_or(0)
    }

    fn read_spectrum(&mut self, out_db: &mut Vec<f32>) -> Result<()> {
        let analyser = self
            .analyser
            .as_mut()
            .ok_or_else(|| TriggerRigError::capability("input device is closed"))?;

        self.window.clear();
        {
            let ring = self
                .ring
                .lock()
                .map_err(|_| TriggerRigError::msg("sample ring has been poisoned"))?;
            self.window.extend(ring.iter().copied());
        }
        analyser.analyse(&self.window, out_db)
    }

    fn close(&mut self) {
        // Dropping the sender wakes the stream thread, which drops the stream.
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("capture thread panicked");
            }
        }
        self.analyser = None;
    }
}

impl Drop for DeviceSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn stream_thread(
    device_id: Option<String>,
    ring: SampleRing,
    capacity: usize,
    ready: oneshot::Sender<Result<u32>>,
    stop: mpsc::Receiver<()>,
) {
    let stream = match open_stream(device_id.as_deref(), ring, capacity) {
        Ok((stream, sample_rate)) => {
            let _ = ready.send(Ok(sample_rate));
            stream
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    let _ = stop.recv();
    drop(stream);
    info!("input stream released");
}

fn capability(err: impl std::fmt::Display) -> TriggerRigError {
    TriggerRigError::capability(err.to_string())
}

fn find_device(device_id: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();
    match device_id {
        Some(id) => host
            .input_devices()
            .map_err(capability)?
            .find(|device| device.name().map(|name| name == id).unwrap_or(false))
            .ok_or_else(|| TriggerRigError::capability(format!("input device {id} not found"))),
        None => host
            .default_input_device()
            .ok_or_else(|| TriggerRigError::capability("no default input device available")),
    }
}

fn open_stream(device_id: Option<&str>, ring: SampleRing, capacity: usize) -> Result<(Stream, u32)> {
    let device = find_device(device_id)?;
    let supported = device.default_input_config().map_err(capability)?;
    let config: StreamConfig = supported.config();
    let channels = usize::from(config.channels.max(1));

    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".into()),
        sample_rate = config.sample_rate.0,
        channels,
        format = ?supported.sample_format(),
        "opening input stream"
    );

    let on_error = |err: cpal::StreamError| error!(%err, "input stream error");
    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                push_frames(&ring, data, channels, capacity, |s| s)
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                push_frames(&ring, data, channels, capacity, |s| f32::from(s) / f32::from(i16::MAX))
            },
            on_error,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let mid = f32::from(u16::MAX) / 2.0;
                push_frames(&ring, data, channels, capacity, |s| (f32::from(s) - mid) / mid)
            },
            on_error,
            None,
        ),
        other => {
            return Err(TriggerRigError::capability(format!(
                "unsupported sample format: {other:?}"
            )))
        }
    }
    .map_err(capability)?;

    stream.play().map_err(capability)?;
    Ok((stream, config.sample_rate.0))
}

fn push_frames<T: Copy>(
    ring: &SampleRing,
    data: &[T],
    channels: usize,
    capacity: usize,
    to_f32: impl Fn(T) -> f32,
) {
    let Ok(mut ring) = ring.lock() else {
        return;
    };
    for frame in data.chunks_exact(channels) {
        let sum: f32 = frame.iter().map(|&sample| to_f32(sample)).sum();
        ring.push_back(sum / channels as f32);
    }
    while ring.len() > capacity {
        ring.pop_front();
    }
}
