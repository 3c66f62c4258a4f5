mod audio_engine;
mod cache;
mod capture;
mod stream;

use std::path::Path;

pub use audio_engine::AudioEngineBridge;
pub use cache::DecodeCache;
pub use capture::{Capture, InputRecorder};

pub use stepmix_transport::{AudioConfig, EngineEvent, LayerAudioInfo};

/// Result of a bridge call. Zero is success, positive codes are benign
/// no-ops, negative codes are failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    AlreadyRunning,
    NotRunning,
    DeviceUnavailable,
    StreamFailed,
    DecodeFailed,
    UnsupportedFormat,
    InvalidSnapshot,
    QueueFull,
}

impl EngineStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::AlreadyRunning => 1,
            Self::NotRunning => 2,
            Self::DeviceUnavailable => -1,
            Self::StreamFailed => -2,
            Self::DecodeFailed => -3,
            Self::UnsupportedFormat => -4,
            Self::InvalidSnapshot => -5,
            Self::QueueFull => -6,
        }
    }

    pub fn is_error(self) -> bool {
        self.code() < 0
    }
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Ok => "ok",
            Self::AlreadyRunning => "engine already running",
            Self::NotRunning => "engine not running",
            Self::DeviceUnavailable => "no audio device available",
            Self::StreamFailed => "audio stream failed",
            Self::DecodeFailed => "could not decode layer audio",
            Self::UnsupportedFormat => "unsupported device sample format",
            Self::InvalidSnapshot => "invalid mix snapshot",
            Self::QueueFull => "snapshot queue full",
        };
        write!(f, "{text} ({})", self.code())
    }
}

/// Receives engine events on the thread that calls
/// [`EngineBridge::dispatch_events`].
pub trait PlaybackListener: Send {
    /// `fraction` is in `[0, 1]`.
    fn update_progress(&mut self, fraction: f32);
    fn on_playback_finished(&mut self);
    fn update_waveform_points(&mut self, points: &[f32]);
    fn on_render_finished(&mut self, _path: &Path, _success: bool) {}
}

/// Contract between the session and a real-time mixing engine.
///
/// No call panics or returns an error type across this boundary; callers
/// check the returned status.
pub trait EngineBridge {
    /// Open the output stream and play the current snapshot from the top.
    fn start_audio_engine(&mut self) -> EngineStatus;

    /// Close the output stream and cancel pending renders. Safe in any state.
    fn stop_audio_engine(&mut self) -> EngineStatus;

    /// Tempo used by the next [`set_layers`](Self::set_layers).
    fn set_tempo(&mut self, bpm: f32) -> EngineStatus;

    /// Replace the whole mix set. On failure the previous set stays active.
    fn set_layers(&mut self, layers: &[LayerAudioInfo], max_used_bars: u32) -> EngineStatus;

    /// Render the current set to a 16-bit WAV of exactly `total_frames` frames.
    fn render_mix_to_wav(&mut self, path: &Path, total_frames: u64) -> bool;

    /// Same as [`render_mix_to_wav`](Self::render_mix_to_wav) on a worker
    /// thread. Completion arrives as [`EngineEvent::RenderFinished`].
    fn spawn_render(&mut self, path: &Path, total_frames: u64) -> bool;

    /// Decode `path` and enqueue its display envelope.
    fn generate_waveform_points(&mut self, path: &Path) -> bool;

    /// Duration from the WAV header, or `-1.0` if it cannot be read.
    fn get_wav_duration_seconds(&self, path: &Path) -> f32;

    /// Replace the event sink. The previous listener is dropped.
    fn set_callback(&mut self, listener: Box<dyn PlaybackListener>);

    /// Deliver queued events to the listener. Returns how many were handled.
    fn dispatch_events(&mut self) -> usize;

    fn is_running(&self) -> bool;
}

/// Hand one event to a listener.
pub fn deliver(listener: &mut dyn PlaybackListener, event: &EngineEvent) {
    match event {
        EngineEvent::Progress(fraction) => listener.update_progress(fraction.clamp(0.0, 1.0)),
        EngineEvent::PlaybackFinished => listener.on_playback_finished(),
        EngineEvent::WaveformPoints(points) => listener.update_waveform_points(points),
        EngineEvent::RenderFinished { path, success } => {
            listener.on_render_finished(path, *success)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_convention() {
        assert_eq!(EngineStatus::Ok.code(), 0);
        assert!(EngineStatus::AlreadyRunning.code() > 0);
        assert!(EngineStatus::NotRunning.code() > 0);
        for status in [
            EngineStatus::DeviceUnavailable,
            EngineStatus::StreamFailed,
            EngineStatus::DecodeFailed,
            EngineStatus::UnsupportedFormat,
            EngineStatus::InvalidSnapshot,
            EngineStatus::QueueFull,
        ] {
            assert!(status.is_error(), "{status}");
        }
        assert!(!EngineStatus::NotRunning.is_error());
    }
}
