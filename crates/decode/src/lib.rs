use std::fs::File;
use std::path::Path;

use anyhow::Context;
use log::debug;
use stepmix_transport::AudioArc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Decode a whole audio file into normalized interleaved f32 samples.
pub fn decode_file(path: &Path) -> anyhow::Result<AudioArc> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow::anyhow!("no default track in {}", path.display()))?;

    let sample_rate = track.codec_params.sample_rate.unwrap_or(44100);
    let channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(2) as u16;
    let track_id = track.id;

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // A corrupt packet is skipped, not fatal
            Err(SymphoniaError::DecodeError(msg)) => {
                debug!("skipping bad packet in {}: {msg}", path.display());
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let spec = *decoded.spec();
        let duration = decoded.capacity() as u64;

        let mut sample_buf = SampleBuffer::<f32>::new(duration, spec);
        sample_buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sample_buf.samples());
    }

    // Drop a trailing partial frame rather than reject the clip
    let whole = samples.len() - samples.len() % channels.max(1) as usize;
    samples.truncate(whole);

    debug!(
        "decoded {}: {} samples, {} Hz, {} ch",
        path.display(),
        samples.len(),
        sample_rate,
        channels
    );

    Ok(AudioArc::new(samples, sample_rate, channels.max(1)))
}

/// Decode and convert to `sample_rate`.
pub fn decode_resampled(path: &Path, sample_rate: u32) -> anyhow::Result<AudioArc> {
    decode_file(path)?.resample(sample_rate)
}

/// Duration in seconds read from the WAV header alone.
pub fn wav_duration_seconds(path: &Path) -> anyhow::Result<f64> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("reading WAV header of {}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        anyhow::bail!("{} declares a zero sample rate", path.display());
    }
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tone(path: &Path, frames: usize, sample_rate: u32, channels: u16) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            let value = if i % 2 == 0 { i16::MAX / 2 } else { -(i16::MAX / 2) };
            for _ in 0..channels {
                writer.write_sample(value).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_decode_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_tone(&path, 4410, 44100, 2);

        let audio = decode_file(&path).unwrap();

        assert_eq!(audio.sample_rate(), 44100);
        assert_eq!(audio.channels(), 2);
        assert_eq!(audio.frames(), 4410);
        assert!((audio.samples()[0] - 0.5).abs() < 0.01, "16-bit half scale");
    }

    #[test]
    fn test_decode_missing_file() {
        assert!(decode_file(Path::new("/nonexistent/clip.wav")).is_err());
    }

    #[test]
    fn test_decode_resampled_changes_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("low.wav");
        write_tone(&path, 2205, 22050, 1);

        let audio = decode_resampled(&path, 44100).unwrap();

        assert_eq!(audio.sample_rate(), 44100);
        assert_eq!(audio.channels(), 1);
    }

    #[test]
    fn test_wav_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("two_seconds.wav");
        write_tone(&path, 88200, 44100, 2);

        let secs = wav_duration_seconds(&path).unwrap();
        assert!((secs - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_wav_duration_of_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a.wav");
        std::fs::write(&path, b"definitely not riff").unwrap();

        assert!(wav_duration_seconds(&path).is_err());
    }
}
