mod audio;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use audio::{AudioArc, resample_audio_arc, waveform_envelope};

/// Number of steps on the shared pattern grid.
pub const GRID_STEPS: u32 = 64;

/// Beats in one grid step. A step is one 4/4 bar of the project tempo.
pub const BEATS_PER_STEP: f64 = 4.0;

/// Seconds covered by one grid step at `bpm`.
pub fn seconds_per_step(bpm: f64) -> f64 {
    BEATS_PER_STEP * 60.0 / bpm
}

/// Output frames covered by one grid step.
pub fn frames_per_step(bpm: f64, sample_rate: u32) -> f64 {
    seconds_per_step(bpm) * sample_rate as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub u32);

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A contiguous run of active steps, `[start, start + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternBlock {
    pub start: u32,
    pub length: u32,
}

impl PatternBlock {
    pub fn new(start: u32, length: u32) -> Self {
        Self { start, length }
    }

    /// Exclusive end, clamped to the grid.
    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.length).min(GRID_STEPS)
    }

    pub fn contains(&self, step: u32) -> bool {
        step >= self.start && step < self.end()
    }

    /// True when the block marks at least one step on the grid.
    pub fn is_on_grid(&self) -> bool {
        self.length > 0 && self.start < GRID_STEPS
    }
}

/// Per-layer mixing parameters handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerAudioInfo {
    pub id: LayerId,
    pub wav_path: PathBuf,
    pub pattern_blocks: Vec<PatternBlock>,
    pub volume: f32,
    pub playback_rate: f32,
}

/// Events the engine enqueues for the control thread.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Fraction of the loop played so far, in `[0, 1]`.
    Progress(f32),
    PlaybackFinished,
    WaveformPoints(Vec<f32>),
    RenderFinished { path: PathBuf, success: bool },
}

/// Engine output format and pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames mixed per offline render block.
    pub block_size: usize,
    pub waveform_points: usize,
    /// Minimum audio time between two progress events.
    pub progress_interval_ms: u64,
    /// Capacity of the engine event channel.
    pub event_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            block_size: 512,
            waveform_points: 100,
            progress_interval_ms: 100,
            event_capacity: 256,
        }
    }
}

impl AudioConfig {
    /// Output frames between two progress events.
    pub fn progress_interval_frames(&self) -> u64 {
        (self.sample_rate as u64 * self.progress_interval_ms / 1000).max(1)
    }
}
