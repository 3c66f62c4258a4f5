use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use log::info;

use crate::mixer::{MixSnapshot, Mixer};

fn render_blocks<F>(
    snapshot: &MixSnapshot,
    total_frames: u64,
    channels: u16,
    block_size: usize,
    cancel: &AtomicBool,
    mut sink: F,
) -> anyhow::Result<()>
where
    F: FnMut(&[f32]) -> anyhow::Result<()>,
{
    let channels = channels.max(1) as usize;
    let block_size = block_size.max(1);
    let mut mixer = Mixer::new();
    let mut buffer = vec![0.0f32; block_size * channels];
    let mut remaining = total_frames;

    while remaining > 0 {
        if cancel.load(Ordering::Relaxed) {
            anyhow::bail!("render cancelled");
        }
        let frames = remaining.min(block_size as u64) as usize;
        let out = &mut buffer[..frames * channels];
        mixer.mix(snapshot, out, channels);
        sink(out)?;
        remaining -= frames as u64;
    }
    Ok(())
}

/// Offline mix of exactly `total_frames` frames into memory.
pub fn render_to_buffer(
    snapshot: &MixSnapshot,
    total_frames: u64,
    channels: u16,
    block_size: usize,
) -> anyhow::Result<Vec<f32>> {
    let mut samples = Vec::with_capacity(total_frames as usize * channels as usize);
    let never = AtomicBool::new(false);
    render_blocks(snapshot, total_frames, channels, block_size, &never, |block| {
        samples.extend_from_slice(block);
        Ok(())
    })?;
    Ok(samples)
}

/// Offline mix written as 16-bit PCM WAV.
///
/// Samples go to a temporary file next to `path` which replaces `path` only
/// after the writer is finalized. A failed or cancelled render leaves any
/// previous file at `path` untouched.
pub fn render_to_wav(
    snapshot: &MixSnapshot,
    path: &Path,
    total_frames: u64,
    channels: u16,
    block_size: usize,
    cancel: &AtomicBool,
) -> anyhow::Result<()> {
    if snapshot.is_empty() {
        anyhow::bail!("nothing to render");
    }

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;

    let spec = hound::WavSpec {
        channels: channels.max(1),
        sample_rate: snapshot.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    {
        let mut writer = hound::WavWriter::new(BufWriter::new(&mut tmp), spec)?;
        render_blocks(snapshot, total_frames, channels, block_size, cancel, |block| {
            for &sample in block {
                writer.write_sample((sample * i16::MAX as f32) as i16)?;
            }
            Ok(())
        })?;
        writer.finalize()?;
    }

    tmp.persist(path)?;
    info!("rendered {total_frames} frames to {}", path.display());
    Ok(())
}
