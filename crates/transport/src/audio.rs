use std::sync::Arc;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Shared, immutable interleaved sample data.
///
/// Cloning only bumps the reference count, so a decoded clip can sit in the
/// decode cache, a live mix snapshot and an offline render at the same time.
///
/// ```text
/// AudioArc
/// ├─ samples: Arc<[f32]> ────> Heap: [L, R, L, R, ...]
/// ├─ sample_rate: u32
/// └─ channels: u16
/// ```
///
/// ```
/// use stepmix_transport::AudioArc;
///
/// let audio = AudioArc::new(vec![0.0, 0.5, 1.0, 0.5], 44100, 2);
/// let shared = audio.clone();
/// assert_eq!(shared.frames(), 2);
/// ```
#[derive(Clone)]
pub struct AudioArc {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl AudioArc {
    /// # Panics
    ///
    /// Panics if `channels` is 0 or `samples.len()` is not a whole number of frames.
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        assert!(channels > 0, "channels must be greater than 0");
        assert_eq!(
            samples.len() % channels as usize,
            0,
            "samples.len() must be divisible by channels"
        );
        Self {
            samples: Arc::from(samples),
            sample_rate,
            channels,
        }
    }

    /// A zero-length clip, used as a placeholder voice.
    pub fn silent(sample_rate: u32, channels: u16) -> Self {
        Self::new(Vec::new(), sample_rate, channels)
    }

    #[inline]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_arc(&self) -> &Arc<[f32]> {
        &self.samples
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames (samples per channel).
    #[inline]
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Sample at `frame` for output channel `ch`, folding channels when the
    /// clip has fewer channels than the output. Out of range reads are silent.
    #[inline]
    pub fn sample(&self, frame: usize, ch: usize) -> f32 {
        let channels = self.channels as usize;
        let idx = frame * channels + ch % channels;
        self.samples.get(idx).copied().unwrap_or(0.0)
    }

    /// Resample to `target_sample_rate`, returning a cheap clone when the
    /// rate already matches.
    pub fn resample(&self, target_sample_rate: u32) -> anyhow::Result<Self> {
        if self.sample_rate == target_sample_rate {
            return Ok(self.clone());
        }
        resample_audio_arc(self, target_sample_rate)
    }
}

impl std::fmt::Debug for AudioArc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioArc")
            .field("frames", &self.frames())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("duration_secs", &self.duration_secs())
            .finish()
    }
}

/// Sinc resampling of a whole clip with rubato.
pub fn resample_audio_arc(audio: &AudioArc, target_sample_rate: u32) -> anyhow::Result<AudioArc> {
    if audio.sample_rate == target_sample_rate || audio.is_empty() {
        return Ok(AudioArc::new(
            audio.samples.to_vec(),
            target_sample_rate,
            audio.channels,
        ));
    }
    if audio.sample_rate == 0 {
        anyhow::bail!("source sample rate is zero");
    }

    let channels = audio.channels as usize;
    let input_frames = audio.frames();
    let resample_ratio = target_sample_rate as f64 / audio.sample_rate as f64;

    // rubato wants planar input
    let mut planar = vec![Vec::with_capacity(input_frames); channels];
    for frame in audio.samples.chunks_exact(channels) {
        for (ch, &s) in frame.iter().enumerate() {
            planar[ch].push(s);
        }
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler =
        SincFixedIn::<f32>::new(resample_ratio, 2.0, params, input_frames, channels)?;
    let output = resampler.process(&planar, None)?;

    let out_frames = output.first().map(|c| c.len()).unwrap_or(0);
    let mut interleaved = Vec::with_capacity(out_frames * channels);
    for frame in 0..out_frames {
        for channel in &output {
            interleaved.push(channel[frame]);
        }
    }

    Ok(AudioArc::new(interleaved, target_sample_rate, audio.channels))
}

/// Down-sampled amplitude envelope for waveform display.
///
/// The clip is mixed down to mono and split into `points` equal buckets; each
/// point is the peak absolute amplitude of its bucket, so values lie in
/// `[0, 1]` for normalized input. A clip shorter than `points` frames yields
/// zeros for the buckets it cannot fill.
pub fn waveform_envelope(audio: &AudioArc, points: usize) -> Vec<f32> {
    let frames = audio.frames();
    let channels = audio.channels as usize;
    let samples = audio.samples();
    let mut envelope = Vec::with_capacity(points);

    for point in 0..points {
        let start = point * frames / points;
        let end = ((point + 1) * frames / points).min(frames);

        let mut peak: f32 = 0.0;
        for frame in samples[start * channels..end * channels].chunks_exact(channels) {
            let mono = frame.iter().sum::<f32>() / channels as f32;
            peak = peak.max(mono.abs());
        }
        envelope.push(peak);
    }

    envelope
}
