use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{info, warn};

/// Records audio into a WAV file.
pub trait Capture {
    fn start(&mut self, path: &Path) -> anyhow::Result<()>;
    /// Finish the file and return its path.
    fn stop(&mut self) -> anyhow::Result<PathBuf>;
    fn is_capturing(&self) -> bool;
}

struct Session {
    path: PathBuf,
    writer: JoinHandle<anyhow::Result<u64>>,
    dropped: Arc<AtomicU64>,
    stream: cpal::Stream,
}

/// Seconds of input the ring holds while the writer catches up.
const RING_SECONDS: usize = 2;

const WRITER_IDLE: Duration = Duration::from_millis(5);

/// Default input device to 16-bit PCM. The callback only converts into a
/// preallocated rtrb ring; a writer thread owns the file.
#[derive(Default)]
pub struct InputRecorder {
    session: Option<Session>,
}

impl InputRecorder {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Push converted samples, counting the ones that find the ring full.
fn push_input(ring: &mut rtrb::Producer<i16>, data: &[f32], dropped: &AtomicU64) {
    let mut lost = 0u64;
    for &s in data {
        let sample = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        if ring.push(sample).is_err() {
            lost += 1;
        }
    }
    if lost > 0 {
        dropped.fetch_add(lost, Ordering::Relaxed);
    }
}

/// Drain `ring` into a WAV file until its producer is gone and it is empty.
fn write_samples(
    path: PathBuf,
    spec: hound::WavSpec,
    mut ring: rtrb::Consumer<i16>,
) -> anyhow::Result<u64> {
    let mut writer = hound::WavWriter::create(&path, spec)
        .with_context(|| format!("creating {}", path.display()))?;
    let mut written = 0u64;
    loop {
        let before = written;
        while let Ok(sample) = ring.pop() {
            writer.write_sample(sample)?;
            written += 1;
        }
        if ring.is_abandoned() && ring.is_empty() {
            break;
        }
        if written == before {
            std::thread::sleep(WRITER_IDLE);
        }
    }
    writer.finalize()?;
    Ok(written)
}

impl Capture for InputRecorder {
    fn start(&mut self, path: &Path) -> anyhow::Result<()> {
        if self.session.is_some() {
            anyhow::bail!("already recording");
        }

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .context("no default input device")?;
        let supported = device
            .default_input_config()
            .context("no default input config")?;
        if supported.sample_format() != cpal::SampleFormat::F32 {
            anyhow::bail!("unsupported input format '{}'", supported.sample_format());
        }
        let config: cpal::StreamConfig = supported.into();

        let spec = hound::WavSpec {
            channels: config.channels,
            sample_rate: config.sample_rate.0,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let capacity = spec.sample_rate as usize * spec.channels as usize * RING_SECONDS;
        let (mut producer, consumer) = rtrb::RingBuffer::<i16>::new(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let lost = dropped.clone();

        let stream = device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                push_input(&mut producer, data, &lost);
            },
            |err| eprintln!("input stream error: {err}"),
            None,
        )?;

        let writer_path = path.to_path_buf();
        let writer = std::thread::Builder::new()
            .name("stepmix-capture".into())
            .spawn(move || write_samples(writer_path, spec, consumer))?;
        stream.play()?;

        info!(
            "recording {} ch at {} Hz to {}",
            spec.channels,
            spec.sample_rate,
            path.display()
        );
        self.session = Some(Session {
            path: path.to_path_buf(),
            writer,
            dropped,
            stream,
        });
        Ok(())
    }

    /// Fails when the writer fell behind and input was lost, even though the
    /// file itself is complete.
    fn stop(&mut self) -> anyhow::Result<PathBuf> {
        let Session {
            path,
            writer,
            dropped,
            stream,
        } = self.session.take().context("not recording")?;
        drop(stream);

        let written = match writer.join() {
            Ok(result) => result?,
            Err(_) => {
                warn!("capture writer thread panicked");
                anyhow::bail!("capture writer failed for {}", path.display())
            }
        };

        let lost = dropped.load(Ordering::Relaxed);
        if lost > 0 {
            warn!("{lost} input samples lost while recording {}", path.display());
            anyhow::bail!(
                "recording {} has gaps: {lost} samples dropped",
                path.display()
            );
        }
        info!("recorded {written} samples to {}", path.display());
        Ok(path)
    }

    fn is_capturing(&self) -> bool {
        self.session.is_some()
    }
}
