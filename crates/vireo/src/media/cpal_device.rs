//! cpal-backed audio output device.
//!
//! cpal streams are not `Send`, so the device owns a control thread
//! that builds and holds the stream; the [`AudioDevice`] methods talk
//! to it over a channel. The real-time callback adapts cpal's typed
//! sample buffers to the engine's byte-oriented fill.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Sender};

use vireo_core::{AudioParams, ChannelLayout, SampleFormat};

use super::source::{AudioDevice, AudioFill, AudioSpec, MediaError};

enum Command {
    Open {
        wanted: AudioParams,
        buffer_samples: usize,
        fill: AudioFill,
        reply: Sender<Result<AudioSpec, MediaError>>,
    },
    Pause(bool),
    Close,
    Shutdown,
}

/// Audio output through the host's default cpal device.
pub struct CpalAudioDevice {
    commands: Sender<Command>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CpalAudioDevice {
    pub fn new() -> Result<Self, MediaError> {
        let (tx, rx) = bounded::<Command>(4);
        let thread = std::thread::Builder::new()
            .name("vireo-cpal".into())
            .spawn(move || {
                let mut stream: Option<cpal::Stream> = None;
                while let Ok(command) = rx.recv() {
                    match command {
                        Command::Open {
                            wanted,
                            buffer_samples,
                            fill,
                            reply,
                        } => {
                            let result = build_stream(wanted, buffer_samples, fill);
                            match result {
                                Ok((new_stream, spec)) => {
                                    stream = Some(new_stream);
                                    let _ = reply.send(Ok(spec));
                                }
                                Err(err) => {
                                    let _ = reply.send(Err(err));
                                }
                            }
                        }
                        Command::Pause(paused) => {
                            if let Some(stream) = stream.as_ref() {
                                let result = if paused { stream.pause() } else { stream.play() };
                                if let Err(err) = result {
                                    tracing::warn!(error = %err, "audio stream pause/play failed");
                                }
                            }
                        }
                        Command::Close => {
                            stream = None;
                        }
                        Command::Shutdown => return,
                    }
                }
            })
            .map_err(|e| MediaError::Device(e.to_string()))?;
        Ok(Self {
            commands: tx,
            thread: Some(thread),
        })
    }
}

fn build_stream(
    wanted: AudioParams,
    buffer_samples: usize,
    fill: AudioFill,
) -> Result<(cpal::Stream, AudioSpec), MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| MediaError::Device("no default output device".into()))?;

    let supported = device
        .default_output_config()
        .map_err(|e| MediaError::Device(e.to_string()))?;
    let channels = wanted.layout.channels.min(supported.channels()).max(1);

    // The fill sits behind a shared slot so the fallback attempt can
    // reuse it after a rejected first configuration.
    let fill = std::sync::Arc::new(parking_lot::Mutex::new(fill));
    let make_callback = |fill: std::sync::Arc<parking_lot::Mutex<AudioFill>>| {
        let mut scratch: Vec<u8> = Vec::new();
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            scratch.clear();
            scratch.resize(data.len() * 4, 0);
            (fill.lock())(&mut scratch);
            for (sample, chunk) in data.iter_mut().zip(scratch.chunks_exact(4)) {
                *sample = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
    };
    let err_fn = |err| tracing::warn!(error = %err, "audio stream error");

    // First ask for exactly what the pipeline wants; degrade to the
    // device's native rate and default buffering when that fails. The
    // pipeline resamples to whatever is reported back.
    let exact = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(wanted.freq),
        buffer_size: cpal::BufferSize::Fixed(buffer_samples as u32),
    };
    let (stream, freq) =
        match device.build_output_stream(&exact, make_callback(fill.clone()), err_fn, None) {
            Ok(stream) => (stream, wanted.freq),
            Err(first_err) => {
                tracing::warn!(
                    error = %first_err,
                    "wanted audio config rejected, using device default"
                );
                let freq = supported.config().sample_rate.0;
                let fallback = cpal::StreamConfig {
                    channels,
                    sample_rate: cpal::SampleRate(freq),
                    buffer_size: cpal::BufferSize::Default,
                };
                let stream = device
                    .build_output_stream(&fallback, make_callback(fill.clone()), err_fn, None)
                    .map_err(|e| MediaError::Device(e.to_string()))?;
                (stream, freq)
            }
        };
    stream.play().map_err(|e| MediaError::Device(e.to_string()))?;

    let granted = AudioParams {
        freq,
        layout: ChannelLayout::new(channels),
        format: SampleFormat::F32,
    };
    Ok((
        stream,
        AudioSpec {
            params: granted,
            hw_buffer_bytes: buffer_samples * granted.frame_size(),
        },
    ))
}

impl AudioDevice for CpalAudioDevice {
    fn open(
        &mut self,
        wanted: AudioParams,
        wanted_buffer_samples: usize,
        fill: AudioFill,
    ) -> Result<AudioSpec, MediaError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.commands
            .send(Command::Open {
                wanted,
                buffer_samples: wanted_buffer_samples,
                fill,
                reply: reply_tx,
            })
            .map_err(|_| MediaError::Device("audio control thread gone".into()))?;
        reply_rx
            .recv()
            .map_err(|_| MediaError::Device("audio control thread gone".into()))?
    }

    fn pause(&mut self, paused: bool) {
        let _ = self.commands.send(Command::Pause(paused));
    }

    fn close(&mut self) {
        let _ = self.commands.send(Command::Close);
    }
}

impl Drop for CpalAudioDevice {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
