use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use basedrop::Shared;
use cpal::{
    FromSample, SizedSample,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use crossbeam_channel::Sender;
use stepmix_render::{MixSnapshot, Mixer};
use stepmix_transport::{AudioConfig, EngineEvent};

use crate::EngineStatus;

pub(crate) type SharedSnapshot = Shared<MixSnapshot>;

/// Frames mixed per pass inside the callback. Larger device buffers are
/// processed in several passes.
const SCRATCH_FRAMES: usize = 1024;

const SNAPSHOT_QUEUE: usize = 8;

pub(crate) struct OutputStream {
    pub snapshots: rtrb::Producer<SharedSnapshot>,
    pub sample_rate: u32,
    /// Latched by the callback once the loop has played through.
    pub finished: Arc<AtomicBool>,
    _stream: Option<cpal::Stream>,
}

impl OutputStream {
    /// An output with no device behind it. The returned consumer stands in
    /// for the audio thread.
    #[cfg(test)]
    pub fn detached(sample_rate: u32, capacity: usize) -> (Self, rtrb::Consumer<SharedSnapshot>) {
        let (snapshots, consumer) = rtrb::RingBuffer::new(capacity);
        let output = Self {
            snapshots,
            sample_rate,
            finished: Arc::new(AtomicBool::new(false)),
            _stream: None,
        };
        (output, consumer)
    }
}

/// Pick a device config at `wanted` Hz when the device supports it,
/// otherwise the device default.
fn choose_config(
    device: &cpal::Device,
    wanted: u32,
) -> Result<cpal::SupportedStreamConfig, EngineStatus> {
    let exact = device.supported_output_configs().ok().and_then(|mut ranges| {
        ranges.find(|r| {
            r.sample_format() == cpal::SampleFormat::F32
                && r.min_sample_rate().0 <= wanted
                && r.max_sample_rate().0 >= wanted
        })
    });
    match exact {
        Some(range) => Ok(range.with_sample_rate(cpal::SampleRate(wanted))),
        None => device
            .default_output_config()
            .map_err(|_| EngineStatus::DeviceUnavailable),
    }
}

/// Open the default output device. `initial` is asked for the first snapshot
/// at the rate the device actually runs at.
///
/// `events` only carries progress. Those sends may be dropped when the
/// channel is full, so the end of playback goes through
/// [`OutputStream::finished`] instead.
pub(crate) fn open(
    config: &AudioConfig,
    events: Sender<EngineEvent>,
    initial: impl FnOnce(u32) -> Option<SharedSnapshot>,
) -> Result<OutputStream, EngineStatus> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(EngineStatus::DeviceUnavailable)?;

    let supported = choose_config(&device, config.sample_rate)?;
    let sample_format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.into();
    let sample_rate = stream_config.sample_rate.0;

    let snapshot = initial(sample_rate).ok_or(EngineStatus::DecodeFailed)?;
    let (snapshots_tx, snapshots_rx) = rtrb::RingBuffer::<SharedSnapshot>::new(SNAPSHOT_QUEUE);
    let progress_every = (sample_rate as u64 * config.progress_interval_ms / 1000).max(1);

    let finished = Arc::new(AtomicBool::new(false));
    let args = CallbackArgs {
        snapshot,
        snapshots_rx,
        events,
        finished: finished.clone(),
        progress_every,
    };

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, args),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, args),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, args),
        other => {
            log::warn!("unsupported sample format '{other}'");
            return Err(EngineStatus::UnsupportedFormat);
        }
    }?;

    stream.play().map_err(|e| {
        log::warn!("could not start output stream: {e}");
        EngineStatus::StreamFailed
    })?;

    Ok(OutputStream {
        snapshots: snapshots_tx,
        sample_rate,
        finished,
        _stream: Some(stream),
    })
}

struct CallbackArgs {
    snapshot: SharedSnapshot,
    snapshots_rx: rtrb::Consumer<SharedSnapshot>,
    events: Sender<EngineEvent>,
    finished: Arc<AtomicBool>,
    progress_every: u64,
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    args: CallbackArgs,
) -> Result<cpal::Stream, EngineStatus>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let CallbackArgs {
        snapshot: mut current,
        mut snapshots_rx,
        events,
        finished,
        progress_every,
    } = args;

    let mut mixer = Mixer::new();
    let mut scratch = vec![0.0f32; SCRATCH_FRAMES * channels];
    let mut next_progress = 0u64;
    let mut done = false;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                // Swap in the newest snapshot (lock-free)
                while let Ok(next) = snapshots_rx.pop() {
                    current = next;
                }

                for chunk in data.chunks_mut(scratch.len()) {
                    let buf = &mut scratch[..chunk.len()];
                    mixer.mix(&current, buf, channels);
                    for (out, &sample) in chunk.iter_mut().zip(buf.iter()) {
                        *out = T::from_sample(sample);
                    }
                }

                if done {
                    return;
                }
                if mixer.position() >= next_progress {
                    let _ = events.try_send(EngineEvent::Progress(mixer.progress(&current)));
                    next_progress = mixer.position() + progress_every;
                }
                if mixer.is_finished(&current) {
                    done = true;
                    let _ = events.try_send(EngineEvent::Progress(0.0));
                    finished.store(true, Ordering::Release);
                }
            },
            |err| eprintln!("stream error: {err}"),
            None,
        )
        .map_err(|e| {
            log::warn!("could not build output stream: {e}");
            EngineStatus::StreamFailed
        })
}
