//! Audio device output via cpal (feature `playback`).
//!
//! [`Engine::open_output`] opens the default output device with the
//! engine's configuration and wires the device's data callback to a
//! [`Renderer`](crate::Renderer). Keep the returned [`OutputDevice`]
//! alive for as long as audio should play; dropping it closes the
//! stream.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, StreamConfig};

use crate::common::{assert_error_traits, OutputFormat};
use crate::engine::Engine;

/// Errors that might occur when opening the audio output.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    /// Could not find any output device.
    #[error("Could not find any output device")]
    NoDevice,
    /// Error opening the stream with the OS.
    #[error("Error opening the stream with the OS: {0}")]
    BuildError(String),
    /// Could not start playing the stream.
    #[error("Could not start playing the stream: {0}")]
    PlayError(String),
}
assert_error_traits!(DeviceError);

/// An open output stream feeding the device from an engine.
pub struct OutputDevice {
    _stream: cpal::Stream,
}

fn default_error_callback(err: cpal::StreamError) {
    #[cfg(feature = "tracing")]
    tracing::error!("audio stream error: {err}");
    #[cfg(not(feature = "tracing"))]
    eprintln!("audio stream error: {err}");
}

impl Engine {
    /// Opens the default output device in this engine's
    /// configuration and starts playback.
    pub fn open_output(&self) -> Result<OutputDevice, DeviceError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or(DeviceError::NoDevice)?;

        let config = StreamConfig {
            channels: self.channels().get(),
            sample_rate: self.sample_rate().get(),
            buffer_size: BufferSize::Fixed(self.samples_per_callback() as u32),
        };

        let stream = match self.format() {
            OutputFormat::F32 => {
                let mut renderer = self.renderer();
                device.build_output_stream::<f32, _, _>(
                    &config,
                    move |data, _| renderer.render_f32(data),
                    default_error_callback,
                    None,
                )
            }
            OutputFormat::I16 => {
                let mut renderer = self.renderer();
                device.build_output_stream::<i16, _, _>(
                    &config,
                    move |data, _| renderer.render_i16(data),
                    default_error_callback,
                    None,
                )
            }
        }
        .map_err(|e| DeviceError::BuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| DeviceError::PlayError(e.to_string()))?;

        Ok(OutputDevice { _stream: stream })
    }
}
