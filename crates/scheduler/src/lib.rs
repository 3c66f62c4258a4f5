//! Turns the pattern model into what the mixer consumes: per-layer playback
//! parameters and a step-indexed activation timeline.

use log::debug;
use stepmix_pattern::{Layer, Track};
use stepmix_transport::{GRID_STEPS, LayerAudioInfo, LayerId, PatternBlock, frames_per_step};

/// Speed multiplier aligning a layer's source tempo with the project tempo.
///
/// A layer without a usable source tempo is assumed to match the project and
/// plays at exactly 1.0.
pub fn playback_rate(layer: &Layer, project_bpm: f32) -> f32 {
    match layer.bpm {
        Some(source) if source.is_finite() && source > 0.0 && project_bpm > 0.0 => {
            project_bpm / source
        }
        _ => 1.0,
    }
}

pub fn to_audio_info(layer: &Layer, project_bpm: f32) -> LayerAudioInfo {
    LayerAudioInfo {
        id: layer.id,
        wav_path: layer.wav_path.clone(),
        pattern_blocks: layer.pattern_blocks().to_vec(),
        volume: layer.volume,
        playback_rate: playback_rate(layer, project_bpm),
    }
}

/// Everything the engine needs for one mix, derived fresh from a track.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub layers: Vec<LayerAudioInfo>,
    pub max_used_bars: u32,
    pub bpm: f32,
    /// Layers left out because they have no audio source yet.
    pub excluded: Vec<LayerId>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn total_frames(&self, sample_rate: u32) -> u64 {
        total_frames(self.max_used_bars, self.bpm, sample_rate)
    }
}

pub fn build_snapshot(track: &Track) -> Snapshot {
    let bpm = track.project_bpm();
    let (with_audio, without_audio): (Vec<&Layer>, Vec<&Layer>) =
        track.layers().iter().partition(|l| l.has_audio());

    let layers: Vec<LayerAudioInfo> = with_audio.iter().map(|l| to_audio_info(l, bpm)).collect();
    let max_used_bars = max_used_bars(layers.iter().map(|l| l.pattern_blocks.as_slice()));

    debug!(
        "snapshot: {} layers, {} excluded, {} bars at {} bpm",
        layers.len(),
        without_audio.len(),
        max_used_bars,
        bpm
    );

    Snapshot {
        layers,
        max_used_bars,
        bpm,
        excluded: without_audio.iter().map(|l| l.id).collect(),
    }
}

/// Loop length in steps: the highest active step plus one, rounded up to a
/// power of two and capped at the grid. Zero when nothing is active.
///
/// Depends only on the union of active steps, never on layer order.
pub fn max_used_bars<'a, I>(patterns: I) -> u32
where
    I: IntoIterator<Item = &'a [PatternBlock]>,
{
    let last = patterns
        .into_iter()
        .flat_map(|blocks| blocks.iter())
        .filter(|b| b.is_on_grid())
        .map(|b| b.end())
        .max();

    match last {
        Some(end) => end.next_power_of_two().min(GRID_STEPS),
        None => 0,
    }
}

/// Frames covering `bars` grid steps at `bpm`.
pub fn total_frames(bars: u32, bpm: f32, sample_rate: u32) -> u64 {
    if bpm <= 0.0 {
        return 0;
    }
    (bars as f64 * frames_per_step(bpm as f64, sample_rate)).round() as u64
}

/// Clip length in bars, rounded up to 1, 2, 4 or 8.
pub fn bars_from_duration(seconds: f64, bpm: f32) -> u32 {
    if bpm <= 0.0 || !seconds.is_finite() {
        return 1;
    }
    let bars = seconds * bpm as f64 / 60.0 / 4.0;
    match bars {
        b if b <= 1.0 => 1,
        b if b <= 2.0 => 2,
        b if b <= 4.0 => 4,
        _ => 8,
    }
}

/// One block of one voice, in grid steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    /// Index into the snapshot's layer list.
    pub voice: usize,
    pub start_step: u32,
    pub end_step: u32,
}

impl Activation {
    pub fn len_steps(&self) -> u32 {
        self.end_step - self.start_step
    }
}

/// Activation timeline for a layer set, sorted by start step then voice.
pub fn schedule(layers: &[LayerAudioInfo]) -> Vec<Activation> {
    let mut timeline: Vec<Activation> = layers
        .iter()
        .enumerate()
        .flat_map(|(voice, layer)| {
            layer
                .pattern_blocks
                .iter()
                .filter(|b| b.is_on_grid())
                .map(move |b| Activation {
                    voice,
                    start_step: b.start,
                    end_step: b.end(),
                })
        })
        .collect();
    timeline.sort_by_key(|a| (a.start_step, a.voice));
    timeline
}
