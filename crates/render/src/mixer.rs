use stepmix_scheduler::{max_used_bars, schedule};
use stepmix_transport::{AudioArc, LayerAudioInfo, LayerId, frames_per_step};

/// A decoded layer ready to mix, already at the snapshot's sample rate.
#[derive(Debug, Clone)]
pub struct Voice {
    pub id: LayerId,
    pub audio: AudioArc,
    pub volume: f32,
    pub playback_rate: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScheduledBlock {
    voice: usize,
    start_frame: u64,
    end_frame: u64,
}

/// Immutable mix set. The live engine swaps whole snapshots between
/// callbacks, so a reader never sees a mix of old and new layers.
#[derive(Debug, Clone)]
pub struct MixSnapshot {
    voices: Vec<Voice>,
    /// Sorted by `start_frame`.
    blocks: Vec<ScheduledBlock>,
    loop_bars: u32,
    bpm: f32,
    sample_rate: u32,
    loop_frames: u64,
}

impl MixSnapshot {
    /// `clips[i]` is the decoded audio for `layers[i]`. A `max_used_bars` of
    /// zero derives the loop length from the blocks themselves.
    pub fn new(
        layers: &[LayerAudioInfo],
        clips: Vec<AudioArc>,
        max_used_bars_hint: u32,
        bpm: f32,
        sample_rate: u32,
    ) -> anyhow::Result<Self> {
        if layers.len() != clips.len() {
            anyhow::bail!("{} layers but {} clips", layers.len(), clips.len());
        }
        if !(bpm.is_finite() && bpm > 0.0) {
            anyhow::bail!("invalid tempo {bpm}");
        }
        if let Some(clip) = clips.iter().find(|c| c.sample_rate() != sample_rate) {
            anyhow::bail!(
                "clip at {} Hz in a {} Hz snapshot",
                clip.sample_rate(),
                sample_rate
            );
        }

        let loop_bars = if max_used_bars_hint > 0 {
            max_used_bars_hint
        } else {
            max_used_bars(layers.iter().map(|l| l.pattern_blocks.as_slice()))
        };

        let fps = frames_per_step(bpm as f64, sample_rate);
        let to_frame = |step: u32| (step as f64 * fps).round() as u64;

        let blocks = schedule(layers)
            .into_iter()
            .map(|a| ScheduledBlock {
                voice: a.voice,
                start_frame: to_frame(a.start_step),
                end_frame: to_frame(a.end_step),
            })
            .collect();

        let voices = layers
            .iter()
            .zip(clips)
            .map(|(info, audio)| Voice {
                id: info.id,
                audio,
                volume: info.volume.max(0.0),
                playback_rate: if info.playback_rate > 0.0 && info.playback_rate.is_finite() {
                    info.playback_rate
                } else {
                    1.0
                },
            })
            .collect();

        Ok(Self {
            voices,
            blocks,
            loop_bars,
            bpm,
            sample_rate,
            loop_frames: to_frame(loop_bars),
        })
    }

    pub fn empty(sample_rate: u32) -> Self {
        Self {
            voices: Vec::new(),
            blocks: Vec::new(),
            loop_bars: 0,
            bpm: 120.0,
            sample_rate,
            loop_frames: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn loop_bars(&self) -> u32 {
        self.loop_bars
    }

    pub fn loop_frames(&self) -> u64 {
        self.loop_frames
    }

    pub fn bpm(&self) -> f32 {
        self.bpm
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Play position over a snapshot. Shared by the audio callback and the
/// offline renderer so both produce the same samples.
#[derive(Debug, Default, Clone)]
pub struct Mixer {
    position: u64,
}

impl Mixer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_finished(&self, snapshot: &MixSnapshot) -> bool {
        self.position >= snapshot.loop_frames
    }

    /// Fraction of the loop played, in `[0, 1]`.
    pub fn progress(&self, snapshot: &MixSnapshot) -> f32 {
        if snapshot.loop_frames == 0 {
            return 0.0;
        }
        (self.position as f64 / snapshot.loop_frames as f64).min(1.0) as f32
    }

    /// Fill `out` (interleaved, `channels` wide) with the next frames and
    /// advance. Frames past the loop end are silent. Never allocates.
    pub fn mix(&mut self, snapshot: &MixSnapshot, out: &mut [f32], channels: usize) {
        out.fill(0.0);
        let channels = channels.max(1);
        let frames = (out.len() / channels) as u64;
        let start = self.position;
        self.position += frames;

        let end = (start + frames).min(snapshot.loop_frames);
        if start >= end {
            return;
        }

        for block in &snapshot.blocks {
            if block.start_frame >= end {
                break;
            }
            if block.end_frame <= start {
                continue;
            }

            let voice = &snapshot.voices[block.voice];
            let clip_frames = voice.audio.frames();
            let rate = voice.playback_rate as f64;
            let from = start.max(block.start_frame);
            let to = end.min(block.end_frame);

            for frame in from..to {
                // Each block restarts the clip from its first frame
                let src = (frame - block.start_frame) as f64 * rate;
                let idx = src as usize;
                if idx >= clip_frames {
                    break;
                }
                let frac = (src - idx as f64) as f32;
                let base = (frame - start) as usize * channels;

                for ch in 0..channels {
                    let a = voice.audio.sample(idx, ch);
                    let b = voice.audio.sample(idx + 1, ch);
                    out[base + ch] += (a + (b - a) * frac) * voice.volume;
                }
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepmix_transport::PatternBlock;

    // 60 bpm at 8 Hz: one step is 4 s = 32 frames, easy to reason about
    const BPM: f32 = 60.0;
    const RATE: u32 = 8;
    const STEP: usize = 32;

    fn info(id: u32, blocks: Vec<PatternBlock>, volume: f32, rate: f32) -> LayerAudioInfo {
        LayerAudioInfo {
            id: LayerId(id),
            wav_path: format!("{id}.wav").into(),
            pattern_blocks: blocks,
            volume,
            playback_rate: rate,
        }
    }

    fn constant(value: f32, frames: usize) -> AudioArc {
        AudioArc::new(vec![value; frames], RATE, 1)
    }

    fn mix_all(snapshot: &MixSnapshot, frames: usize, channels: usize) -> Vec<f32> {
        let mut mixer = Mixer::new();
        let mut out = vec![0.0; frames * channels];
        mixer.mix(snapshot, &mut out, channels);
        out
    }

    #[test]
    fn test_block_plays_only_inside_its_steps() {
        let layers = vec![info(1, vec![PatternBlock::new(1, 1)], 1.0, 1.0)];
        let snapshot = MixSnapshot::new(&layers, vec![constant(0.5, 1000)], 2, BPM, RATE).unwrap();

        let out = mix_all(&snapshot, STEP * 2, 1);

        assert!(out[..STEP].iter().all(|&s| s == 0.0), "step 0 is silent");
        assert!(out[STEP..].iter().all(|&s| s == 0.5), "step 1 plays");
    }

    #[test]
    fn test_clip_shorter_than_block_goes_silent() {
        let layers = vec![info(1, vec![PatternBlock::new(0, 1)], 1.0, 1.0)];
        let snapshot = MixSnapshot::new(&layers, vec![constant(0.5, 10)], 1, BPM, RATE).unwrap();

        let out = mix_all(&snapshot, STEP, 1);

        assert!(out[..9].iter().all(|&s| s > 0.0));
        assert!(out[10..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_each_block_restarts_clip() {
        let ramp: Vec<f32> = (0..64).map(|i| i as f32 / 100.0).collect();
        let layers = vec![info(
            1,
            vec![PatternBlock::new(0, 1), PatternBlock::new(1, 1)],
            1.0,
            1.0,
        )];
        let snapshot =
            MixSnapshot::new(&layers, vec![AudioArc::new(ramp, RATE, 1)], 2, BPM, RATE).unwrap();

        let out = mix_all(&snapshot, STEP * 2, 1);

        assert_eq!(out[0], 0.0);
        assert_eq!(out[STEP], 0.0, "second block starts from the top");
        assert!((out[STEP + 5] - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_volume_and_clamp() {
        let layers = vec![
            info(1, vec![PatternBlock::new(0, 1)], 0.5, 1.0),
            info(2, vec![PatternBlock::new(0, 1)], 2.0, 1.0),
        ];
        let clips = vec![constant(0.4, 100), constant(0.4, 100)];
        let snapshot = MixSnapshot::new(&layers, clips, 1, BPM, RATE).unwrap();

        let out = mix_all(&snapshot, 4, 1);
        // 0.4 * 0.5 + 0.4 * 2.0 = 1.0
        assert!((out[0] - 1.0).abs() < 1e-6);

        let loud = vec![info(3, vec![PatternBlock::new(0, 1)], 2.0, 1.0)];
        let snapshot = MixSnapshot::new(&loud, vec![constant(0.9, 100)], 1, BPM, RATE).unwrap();
        assert_eq!(mix_all(&snapshot, 4, 1)[0], 1.0, "sum is clamped");
    }

    #[test]
    fn test_playback_rate_speeds_up_clip() {
        let ramp: Vec<f32> = (0..64).map(|i| i as f32 / 100.0).collect();
        let layers = vec![info(1, vec![PatternBlock::new(0, 1)], 1.0, 2.0)];
        let snapshot =
            MixSnapshot::new(&layers, vec![AudioArc::new(ramp, RATE, 1)], 1, BPM, RATE).unwrap();

        let out = mix_all(&snapshot, 8, 1);

        assert!((out[3] - 0.06).abs() < 1e-6, "frame 3 reads source frame 6");
    }

    #[test]
    fn test_fractional_rate_interpolates() {
        let layers = vec![info(1, vec![PatternBlock::new(0, 1)], 1.0, 0.5)];
        let clip = AudioArc::new(vec![0.0, 1.0, 1.0, 1.0], RATE, 1);
        let snapshot = MixSnapshot::new(&layers, vec![clip], 1, BPM, RATE).unwrap();

        let out = mix_all(&snapshot, 2, 1);

        assert!((out[1] - 0.5).abs() < 1e-6, "halfway between 0 and 1");
    }

    #[test]
    fn test_mono_clip_fills_stereo() {
        let layers = vec![info(1, vec![PatternBlock::new(0, 1)], 1.0, 1.0)];
        let snapshot = MixSnapshot::new(&layers, vec![constant(0.25, 100)], 1, BPM, RATE).unwrap();

        let out = mix_all(&snapshot, 2, 2);
        assert_eq!(out, vec![0.25; 4]);
    }

    #[test]
    fn test_loop_end_and_progress() {
        let layers = vec![info(1, vec![PatternBlock::new(0, 8)], 1.0, 1.0)];
        let snapshot =
            MixSnapshot::new(&layers, vec![constant(0.5, 10_000)], 2, BPM, RATE).unwrap();
        let mut mixer = Mixer::new();
        let mut out = vec![0.0; STEP];

        mixer.mix(&snapshot, &mut out, 1);
        assert!((mixer.progress(&snapshot) - 0.5).abs() < 1e-6);
        assert!(!mixer.is_finished(&snapshot));

        mixer.mix(&snapshot, &mut out, 1);
        assert!(mixer.is_finished(&snapshot));

        mixer.mix(&snapshot, &mut out, 1);
        assert!(out.iter().all(|&s| s == 0.0), "past the loop is silent");
        assert_eq!(mixer.progress(&snapshot), 1.0);
    }

    #[test]
    fn test_zero_hint_derives_loop_from_blocks() {
        let layers = vec![info(1, vec![PatternBlock::new(2, 1)], 1.0, 1.0)];
        let snapshot = MixSnapshot::new(&layers, vec![constant(0.1, 10)], 0, BPM, RATE).unwrap();

        assert_eq!(snapshot.loop_bars(), 4);
        assert_eq!(snapshot.loop_frames(), 4 * STEP as u64);
    }

    #[test]
    fn test_chunked_mix_matches_single_pass() {
        let layers = vec![
            info(1, vec![PatternBlock::new(0, 1), PatternBlock::new(2, 2)], 0.7, 1.25),
            info(2, vec![PatternBlock::new(1, 3)], 0.3, 0.8),
        ];
        let ramp: Vec<f32> = (0..200).map(|i| (i as f32 * 0.37).sin()).collect();
        let clips = vec![AudioArc::new(ramp.clone(), RATE, 1), AudioArc::new(ramp, RATE, 1)];
        let snapshot = MixSnapshot::new(&layers, clips, 4, BPM, RATE).unwrap();

        let whole = mix_all(&snapshot, STEP * 4, 1);

        let mut mixer = Mixer::new();
        let mut chunked = Vec::new();
        let mut buf = vec![0.0; 7];
        while chunked.len() < whole.len() {
            mixer.mix(&snapshot, &mut buf, 1);
            chunked.extend_from_slice(&buf);
        }
        chunked.truncate(whole.len());

        assert_eq!(whole, chunked);
    }

    #[test]
    fn test_rejects_mismatched_clips() {
        let layers = vec![info(1, vec![], 1.0, 1.0)];
        assert!(MixSnapshot::new(&layers, vec![], 1, BPM, RATE).is_err());

        let wrong_rate = AudioArc::new(vec![0.0; 4], RATE * 2, 1);
        assert!(MixSnapshot::new(&layers, vec![wrong_rate], 1, BPM, RATE).is_err());
    }
}
