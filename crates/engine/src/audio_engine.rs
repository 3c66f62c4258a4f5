use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use basedrop::{Collector, Shared};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};
use stepmix_render::{MixSnapshot, render_to_wav};
use stepmix_transport::{AudioConfig, EngineEvent, LayerAudioInfo, waveform_envelope};

use crate::cache::DecodeCache;
use crate::stream::{self, OutputStream, SharedSnapshot};
use crate::{EngineBridge, EngineStatus, PlaybackListener, deliver};

fn build_snapshot(
    cache: &mut DecodeCache,
    layers: &[LayerAudioInfo],
    max_used_bars: u32,
    bpm: f32,
    sample_rate: u32,
) -> Result<MixSnapshot, EngineStatus> {
    let paths: Vec<&Path> = layers.iter().map(|l| l.wav_path.as_path()).collect();
    let clips = cache.load_all(&paths, sample_rate).map_err(|e| {
        warn!("{e:#}");
        EngineStatus::DecodeFailed
    })?;
    MixSnapshot::new(layers, clips, max_used_bars, bpm, sample_rate).map_err(|e| {
        warn!("rejected mix snapshot: {e:#}");
        EngineStatus::InvalidSnapshot
    })
}

/// cpal-backed engine.
///
/// Nothing touches the audio device until [`start_audio_engine`]. Snapshots
/// reach the audio thread through an rtrb queue of basedrop handles, and old
/// ones are reclaimed here on the control thread.
///
/// Progress travels on a bounded channel and may be dropped. Waveforms and
/// render results use an unbounded channel and the end of playback is a
/// latch on the stream, so neither is ever lost.
///
/// [`start_audio_engine`]: EngineBridge::start_audio_engine
pub struct AudioEngineBridge {
    config: AudioConfig,
    collector: Collector,
    cache: DecodeCache,
    tempo: f32,
    layers: Vec<LayerAudioInfo>,
    max_used_bars: u32,
    current: SharedSnapshot,
    output: Option<OutputStream>,
    events_tx: Sender<EngineEvent>,
    events_rx: Receiver<EngineEvent>,
    results_tx: Sender<EngineEvent>,
    results_rx: Receiver<EngineEvent>,
    listener: Option<Box<dyn PlaybackListener>>,
    cancel: Arc<AtomicBool>,
    renders: Vec<JoinHandle<()>>,
}

impl AudioEngineBridge {
    pub fn new(config: AudioConfig) -> Self {
        let collector = Collector::new();
        let current = Shared::new(&collector.handle(), MixSnapshot::empty(config.sample_rate));
        let (events_tx, events_rx) = crossbeam_channel::bounded(config.event_capacity.max(1));
        let (results_tx, results_rx) = crossbeam_channel::unbounded();

        Self {
            config,
            collector,
            cache: DecodeCache::new(),
            tempo: 120.0,
            layers: Vec::new(),
            max_used_bars: 0,
            current,
            output: None,
            events_tx,
            events_rx,
            results_tx,
            results_rx,
            listener: None,
            cancel: Arc::new(AtomicBool::new(false)),
            renders: Vec::new(),
        }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// The mix set renders use, at the configured sample rate.
    pub fn snapshot(&self) -> &MixSnapshot {
        &self.current
    }

    /// Block until every spawned render has finished.
    pub fn wait_for_renders(&mut self) {
        for handle in self.renders.drain(..) {
            let _ = handle.join();
        }
    }

    fn reap_renders(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) =
            self.renders.drain(..).partition(|h| h.is_finished());
        for handle in done {
            let _ = handle.join();
        }
        self.renders = running;
    }

    fn cancel_renders(&mut self) {
        if self.renders.is_empty() {
            return;
        }
        info!("cancelling {} pending render(s)", self.renders.len());
        self.cancel.store(true, Ordering::Relaxed);
        self.wait_for_renders();
        self.cancel = Arc::new(AtomicBool::new(false));
    }

    /// Send `current` to the live stream, rebuilt from `layers` at the device
    /// rate when it differs from the configured one. Touches no other state.
    fn publish(
        &mut self,
        current: &SharedSnapshot,
        layers: &[LayerAudioInfo],
        max_used_bars: u32,
    ) -> EngineStatus {
        let Some(device_rate) = self.output.as_ref().map(|o| o.sample_rate) else {
            return EngineStatus::Ok;
        };

        let live = if device_rate == self.config.sample_rate {
            current.clone()
        } else {
            match build_snapshot(&mut self.cache, layers, max_used_bars, self.tempo, device_rate) {
                Ok(snapshot) => Shared::new(&self.collector.handle(), snapshot),
                Err(status) => return status,
            }
        };

        match self.output.as_mut().map(|o| o.snapshots.push(live)) {
            Some(Err(_)) => {
                warn!("snapshot queue full; audio thread is not draining");
                EngineStatus::QueueFull
            }
            _ => EngineStatus::Ok,
        }
    }
}

impl EngineBridge for AudioEngineBridge {
    fn start_audio_engine(&mut self) -> EngineStatus {
        if self.output.is_some() {
            return EngineStatus::AlreadyRunning;
        }

        // Progress from a previous run must not reach the new one
        let stale = self.events_rx.try_iter().count();
        if stale > 0 {
            debug!("discarded {stale} stale progress event(s)");
        }

        let handle = self.collector.handle();
        let current = self.current.clone();
        let config_rate = self.config.sample_rate;
        let cache = &mut self.cache;
        let layers = &self.layers;
        let (max_used_bars, tempo) = (self.max_used_bars, self.tempo);

        let opened = stream::open(&self.config, self.events_tx.clone(), |device_rate| {
            if device_rate == config_rate {
                return Some(current);
            }
            debug!("device runs at {device_rate} Hz, rebuilding snapshot");
            build_snapshot(cache, layers, max_used_bars, tempo, device_rate)
                .ok()
                .map(|s| Shared::new(&handle, s))
        });

        match opened {
            Ok(output) => {
                info!(
                    "audio engine started at {} Hz with {} layer(s)",
                    output.sample_rate,
                    self.layers.len()
                );
                self.output = Some(output);
                EngineStatus::Ok
            }
            Err(status) => {
                warn!("audio engine failed to start: {status}");
                status
            }
        }
    }

    fn stop_audio_engine(&mut self) -> EngineStatus {
        self.cancel_renders();
        let status = match self.output.take() {
            Some(output) => {
                drop(output);
                info!("audio engine stopped");
                EngineStatus::Ok
            }
            None => EngineStatus::NotRunning,
        };
        self.collector.collect();
        status
    }

    fn set_tempo(&mut self, bpm: f32) -> EngineStatus {
        if !(bpm.is_finite() && bpm > 0.0) {
            return EngineStatus::InvalidSnapshot;
        }
        self.tempo = bpm;
        EngineStatus::Ok
    }

    fn set_layers(&mut self, layers: &[LayerAudioInfo], max_used_bars: u32) -> EngineStatus {
        let snapshot = match build_snapshot(
            &mut self.cache,
            layers,
            max_used_bars,
            self.tempo,
            self.config.sample_rate,
        ) {
            Ok(snapshot) => snapshot,
            Err(status) => return status,
        };

        debug!(
            "new mix set: {} layer(s), {} bar loop",
            layers.len(),
            snapshot.loop_bars()
        );
        let current = Shared::new(&self.collector.handle(), snapshot);
        let status = self.publish(&current, layers, max_used_bars);
        if status.is_error() {
            drop(current);
            self.collector.collect();
            return status;
        }

        self.layers = layers.to_vec();
        self.max_used_bars = max_used_bars;
        self.current = current;
        self.collector.collect();
        status
    }

    fn render_mix_to_wav(&mut self, path: &Path, total_frames: u64) -> bool {
        match render_to_wav(
            &self.current,
            path,
            total_frames,
            self.config.channels,
            self.config.block_size,
            &self.cancel,
        ) {
            Ok(()) => true,
            Err(e) => {
                warn!("render to {} failed: {e:#}", path.display());
                false
            }
        }
    }

    fn spawn_render(&mut self, path: &Path, total_frames: u64) -> bool {
        if self.current.is_empty() {
            warn!("render requested with no layers");
            return false;
        }
        self.reap_renders();

        let snapshot = self.current.clone();
        let cancel = self.cancel.clone();
        let results = self.results_tx.clone();
        let path = path.to_path_buf();
        let (channels, block_size) = (self.config.channels, self.config.block_size);

        let spawned = std::thread::Builder::new()
            .name("stepmix-render".into())
            .spawn(move || {
                let result =
                    render_to_wav(&snapshot, &path, total_frames, channels, block_size, &cancel);
                if let Err(e) = &result {
                    warn!("render to {} failed: {e:#}", path.display());
                }
                let _ = results.send(EngineEvent::RenderFinished {
                    path,
                    success: result.is_ok(),
                });
            });

        match spawned {
            Ok(handle) => {
                self.renders.push(handle);
                true
            }
            Err(e) => {
                warn!("could not spawn render thread: {e}");
                false
            }
        }
    }

    fn generate_waveform_points(&mut self, path: &Path) -> bool {
        let audio = match stepmix_decode::decode_file(path) {
            Ok(audio) => audio,
            Err(e) => {
                warn!("waveform for {} failed: {e:#}", path.display());
                return false;
            }
        };
        let points = waveform_envelope(&audio, self.config.waveform_points);
        self.results_tx
            .send(EngineEvent::WaveformPoints(points))
            .is_ok()
    }

    fn get_wav_duration_seconds(&self, path: &Path) -> f32 {
        match stepmix_decode::wav_duration_seconds(path) {
            Ok(secs) => secs as f32,
            Err(e) => {
                warn!("{e:#}");
                -1.0
            }
        }
    }

    fn set_callback(&mut self, listener: Box<dyn PlaybackListener>) {
        self.listener = Some(listener);
    }

    fn dispatch_events(&mut self) -> usize {
        let mut batch: Vec<EngineEvent> = self.events_rx.try_iter().collect();
        batch.extend(self.results_rx.try_iter());
        let finished = self
            .output
            .as_ref()
            .is_some_and(|o| o.finished.swap(false, Ordering::AcqRel));
        if finished {
            batch.push(EngineEvent::PlaybackFinished);
        }

        if let Some(listener) = self.listener.as_mut() {
            for event in &batch {
                deliver(listener.as_mut(), event);
            }
        }

        self.reap_renders();
        self.collector.collect();
        batch.len()
    }

    fn is_running(&self) -> bool {
        self.output.is_some()
    }
}

impl Drop for AudioEngineBridge {
    fn drop(&mut self) {
        self.stop_audio_engine();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use stepmix_transport::{LayerId, PatternBlock};

    #[derive(Default)]
    struct Seen {
        finished: usize,
        waveforms: Vec<Vec<f32>>,
        renders: Vec<(PathBuf, bool)>,
    }

    struct Recorder(Arc<Mutex<Seen>>);

    impl PlaybackListener for Recorder {
        fn update_progress(&mut self, _fraction: f32) {}
        fn on_playback_finished(&mut self) {
            self.0.lock().unwrap().finished += 1;
        }
        fn update_waveform_points(&mut self, points: &[f32]) {
            self.0.lock().unwrap().waveforms.push(points.to_vec());
        }
        fn on_render_finished(&mut self, path: &Path, success: bool) {
            self.0.lock().unwrap().renders.push((path.to_path_buf(), success));
        }
    }

    fn write_clip(path: &Path, value: i16, frames: usize) {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..frames * 2 {
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn layer(path: &Path) -> LayerAudioInfo {
        LayerAudioInfo {
            id: LayerId(1),
            wav_path: path.to_path_buf(),
            pattern_blocks: vec![PatternBlock::new(0, 1)],
            volume: 1.0,
            playback_rate: 1.0,
        }
    }

    fn layers_for(paths: &[&Path]) -> Vec<LayerAudioInfo> {
        paths
            .iter()
            .enumerate()
            .map(|(i, path)| LayerAudioInfo {
                id: LayerId(i as u32 + 1),
                ..layer(path)
            })
            .collect()
    }

    fn first_sample(path: &Path) -> i16 {
        let mut reader = hound::WavReader::open(path).unwrap();
        reader.samples::<i16>().next().unwrap().unwrap()
    }

    #[test]
    fn test_stop_when_never_started() {
        let mut engine = AudioEngineBridge::new(AudioConfig::default());
        let status = engine.stop_audio_engine();

        assert_eq!(status, EngineStatus::NotRunning);
        assert!(!status.is_error());
        assert!(!engine.is_running());
        assert_eq!(engine.stop_audio_engine(), EngineStatus::NotRunning);
    }

    #[test]
    fn test_render_without_starting_engine() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.wav");
        let mix = dir.path().join("mix.wav");
        write_clip(&clip, 8000, 1000);
        let mut engine = AudioEngineBridge::new(AudioConfig::default());

        assert_eq!(engine.set_layers(&[layer(&clip)], 1), EngineStatus::Ok);
        assert!(engine.render_mix_to_wav(&mix, 4410));

        let reader = hound::WavReader::open(&mix).unwrap();
        assert_eq!(reader.duration(), 4410);
        assert!(!engine.is_running());
    }

    #[test]
    fn test_failed_set_layers_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.wav");
        write_clip(&clip, 8000, 1000);
        let mut engine = AudioEngineBridge::new(AudioConfig::default());
        engine.set_layers(&[layer(&clip)], 1);

        let missing = dir.path().join("missing.wav");
        let status = engine.set_layers(&[layer(&clip), layer(&missing)], 1);

        assert_eq!(status, EngineStatus::DecodeFailed);
        assert_eq!(engine.snapshot().voices().len(), 1);

        let mix = dir.path().join("mix.wav");
        assert!(engine.render_mix_to_wav(&mix, 100));
        assert!(first_sample(&mix) > 7000, "previous layer still audible");
    }

    #[test]
    fn test_render_with_no_layers_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = AudioEngineBridge::new(AudioConfig::default());

        assert!(!engine.render_mix_to_wav(&dir.path().join("mix.wav"), 100));
        assert!(!engine.spawn_render(&dir.path().join("mix.wav"), 100));
    }

    #[test]
    fn test_spawned_render_reports_completion() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.wav");
        let mix = dir.path().join("mix.wav");
        write_clip(&clip, 8000, 1000);
        let seen = Arc::new(Mutex::new(Seen::default()));
        let mut engine = AudioEngineBridge::new(AudioConfig::default());
        engine.set_callback(Box::new(Recorder(seen.clone())));
        engine.set_layers(&[layer(&clip)], 1);

        assert!(engine.spawn_render(&mix, 2048));
        engine.wait_for_renders();
        assert_eq!(engine.dispatch_events(), 1);

        assert_eq!(seen.lock().unwrap().renders, vec![(mix.clone(), true)]);
        assert!(mix.exists());
    }

    #[test]
    fn test_waveform_points_reach_listener() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.wav");
        write_clip(&clip, 16384, 5000);
        let seen = Arc::new(Mutex::new(Seen::default()));
        let mut engine = AudioEngineBridge::new(AudioConfig::default());
        engine.set_callback(Box::new(Recorder(seen.clone())));

        assert!(engine.generate_waveform_points(&clip));
        engine.dispatch_events();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.waveforms.len(), 1);
        assert_eq!(seen.waveforms[0].len(), 100);
        assert!(seen.waveforms[0].iter().all(|&p| (p - 0.5).abs() < 0.01));
    }

    #[test]
    fn test_waveform_of_missing_file() {
        let mut engine = AudioEngineBridge::new(AudioConfig::default());
        assert!(!engine.generate_waveform_points(Path::new("/nonexistent.wav")));
        assert_eq!(engine.dispatch_events(), 0);
    }

    #[test]
    fn test_replaced_listener_is_dropped() {
        let first = Arc::new(Mutex::new(Seen::default()));
        let mut engine = AudioEngineBridge::new(AudioConfig::default());
        engine.set_callback(Box::new(Recorder(first.clone())));
        assert_eq!(Arc::strong_count(&first), 2);

        engine.set_callback(Box::new(Recorder(Arc::new(Mutex::new(Seen::default())))));
        assert_eq!(Arc::strong_count(&first), 1);
    }

    #[test]
    fn test_wav_duration() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.wav");
        write_clip(&clip, 0, 22050);
        let engine = AudioEngineBridge::new(AudioConfig::default());

        assert!((engine.get_wav_duration_seconds(&clip) - 0.5).abs() < 1e-6);
        assert_eq!(engine.get_wav_duration_seconds(Path::new("/nonexistent.wav")), -1.0);
    }

    #[test]
    fn test_invalid_tempo_is_rejected() {
        let mut engine = AudioEngineBridge::new(AudioConfig::default());
        assert_eq!(engine.set_tempo(0.0), EngineStatus::InvalidSnapshot);
        assert_eq!(engine.set_tempo(f32::NAN), EngineStatus::InvalidSnapshot);
        assert_eq!(engine.set_tempo(96.0), EngineStatus::Ok);
    }

    #[test]
    fn test_full_snapshot_queue_keeps_previous_set() {
        let dir = tempfile::tempdir().unwrap();
        let loud = dir.path().join("loud.wav");
        let quiet = dir.path().join("quiet.wav");
        write_clip(&loud, 8000, 1000);
        write_clip(&quiet, 100, 1000);
        let mut engine = AudioEngineBridge::new(AudioConfig::default());
        // Audio thread never drains, so the second publish finds the queue full
        let (output, _audio_thread) = OutputStream::detached(44100, 1);
        engine.output = Some(output);

        assert_eq!(engine.set_layers(&layers_for(&[&loud]), 1), EngineStatus::Ok);
        let status = engine.set_layers(&layers_for(&[&loud, &quiet]), 1);

        assert_eq!(status, EngineStatus::QueueFull);
        assert_eq!(engine.snapshot().voices().len(), 1, "render set must not change");
        let mix = dir.path().join("mix.wav");
        assert!(engine.render_mix_to_wav(&mix, 100));
        let first = first_sample(&mix);
        assert!((7900..8050).contains(&first), "only the first layer plays, got {first}");
    }

    #[test]
    fn test_live_snapshot_rebuilt_at_device_rate() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.wav");
        write_clip(&clip, 8000, 4410);
        let mut engine = AudioEngineBridge::new(AudioConfig::default());
        let (output, mut audio_thread) = OutputStream::detached(48000, 4);
        engine.output = Some(output);

        assert_eq!(engine.set_layers(&[layer(&clip)], 1), EngineStatus::Ok);

        let live = audio_thread.pop().unwrap();
        assert_eq!(live.sample_rate(), 48000);
        assert_eq!(engine.snapshot().sample_rate(), 44100);
    }

    #[test]
    fn test_playback_finished_survives_full_channel() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let config = AudioConfig {
            event_capacity: 1,
            ..AudioConfig::default()
        };
        let mut engine = AudioEngineBridge::new(config);
        engine.set_callback(Box::new(Recorder(seen.clone())));
        let (output, _audio_thread) = OutputStream::detached(44100, 4);
        let finished = output.finished.clone();
        engine.output = Some(output);

        engine.events_tx.try_send(EngineEvent::Progress(0.9)).unwrap();
        assert!(engine.events_tx.try_send(EngineEvent::Progress(0.95)).is_err());
        finished.store(true, Ordering::Release);

        assert_eq!(engine.dispatch_events(), 2);
        assert_eq!(seen.lock().unwrap().finished, 1);
        engine.dispatch_events();
        assert_eq!(seen.lock().unwrap().finished, 1, "finish is reported once");
    }

    #[test]
    fn test_render_result_survives_full_channel() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.wav");
        let mix = dir.path().join("mix.wav");
        write_clip(&clip, 8000, 1000);
        let seen = Arc::new(Mutex::new(Seen::default()));
        let config = AudioConfig {
            event_capacity: 1,
            ..AudioConfig::default()
        };
        let mut engine = AudioEngineBridge::new(config);
        engine.set_callback(Box::new(Recorder(seen.clone())));
        engine.set_layers(&[layer(&clip)], 1);
        engine.events_tx.try_send(EngineEvent::Progress(0.5)).unwrap();

        assert!(engine.generate_waveform_points(&clip));
        assert!(engine.spawn_render(&mix, 2048));
        engine.wait_for_renders();
        engine.dispatch_events();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.waveforms.len(), 1);
        assert_eq!(seen.renders, vec![(mix, true)]);
    }

    #[test]
    fn test_stop_cancels_spawned_render() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.wav");
        let mix = dir.path().join("mix.wav");
        write_clip(&clip, 8000, 1000);
        let seen = Arc::new(Mutex::new(Seen::default()));
        let mut engine = AudioEngineBridge::new(AudioConfig::default());
        engine.set_callback(Box::new(Recorder(seen.clone())));
        engine.set_layers(&[layer(&clip)], 1);
        assert!(engine.render_mix_to_wav(&mix, 4410));

        // Far too long to finish before the stop below
        assert!(engine.spawn_render(&mix, 1 << 40));
        assert_eq!(engine.stop_audio_engine(), EngineStatus::NotRunning);
        engine.dispatch_events();

        assert_eq!(seen.lock().unwrap().renders, vec![(mix.clone(), false)]);
        let reader = hound::WavReader::open(&mix).unwrap();
        assert_eq!(reader.duration(), 4410, "previous export is untouched");
    }
}
