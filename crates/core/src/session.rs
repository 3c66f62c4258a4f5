//! Owns the pattern model and coordinates playback, recording and export
//! against an [`EngineBridge`].
//!
//! Edits only touch the model. The engine sees changes when playback starts
//! or when [`Session::push_snapshot`] is called.

use std::fmt;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, select};
use log::{debug, info, warn};
use stepmix_engine::{Capture, EngineBridge, EngineStatus, PlaybackListener, deliver};
use stepmix_pattern::{InstrumentType, Layer, PatternError, Track};
use stepmix_scheduler::{Snapshot, bars_from_duration, build_snapshot};
use stepmix_transport::{EngineEvent, LayerId, PatternBlock};

use crate::config::Config;

const COUNTDOWN_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    Idle,
    /// Counting down; capture starts when `remaining` reaches zero.
    Pending { remaining: u32, path: PathBuf },
    Recording { path: PathBuf },
}

/// Why a track cannot be mixed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unresolved {
    /// Layers with an active pattern but no audio file.
    MissingAudio(Vec<LayerId>),
    NoPlayableLayers,
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingAudio(ids) => {
                let ids: Vec<String> = ids.iter().map(LayerId::to_string).collect();
                write!(f, "layers without audio: {}", ids.join(", "))
            }
            Self::NoPlayableLayers => write!(f, "no layer has both audio and an active step"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlayError {
    #[error("track not ready: {0}")]
    Unresolved(Unresolved),

    #[error("engine: {0}")]
    Engine(EngineStatus),

    #[error("could not start render to {}", .0.display())]
    RenderFailed(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("a recording is already pending or in progress")]
    Busy,

    #[error("not recording")]
    NotRecording,

    #[error("recording cancelled during countdown")]
    Cancelled,

    #[error("no finished recording to add")]
    NoRecording,

    #[error("could not read recording {}", .0.display())]
    UnreadableRecording(PathBuf),

    #[error("capture failed: {0}")]
    Capture(String),

    #[error(transparent)]
    Pattern(#[from] PatternError),
}

/// Last completed render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOutcome {
    pub path: PathBuf,
    pub success: bool,
}

/// Collects events delivered by the bridge until [`Session::poll`] reads them.
#[derive(Clone, Default)]
struct Inbox(Arc<Mutex<Vec<EngineEvent>>>);

impl Inbox {
    fn push(&self, event: EngineEvent) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    fn take(&self) -> Vec<EngineEvent> {
        mem::take(&mut *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl PlaybackListener for Inbox {
    fn update_progress(&mut self, fraction: f32) {
        self.push(EngineEvent::Progress(fraction));
    }

    fn on_playback_finished(&mut self) {
        self.push(EngineEvent::PlaybackFinished);
    }

    fn update_waveform_points(&mut self, points: &[f32]) {
        self.push(EngineEvent::WaveformPoints(points.to_vec()));
    }

    fn on_render_finished(&mut self, path: &Path, success: bool) {
        self.push(EngineEvent::RenderFinished {
            path: path.to_path_buf(),
            success,
        });
    }
}

pub struct Session<B: EngineBridge, C: Capture> {
    bridge: B,
    capture: C,
    track: Track,
    config: Config,
    inbox: Inbox,
    observer: Option<Box<dyn PlaybackListener>>,

    playback: PlaybackState,
    record: RecordState,
    progress: f32,
    waveform: Vec<f32>,
    last_recording: Option<PathBuf>,
    last_export: Option<ExportOutcome>,
    pending_preview: Option<PathBuf>,
}

impl<B: EngineBridge, C: Capture> Session<B, C> {
    pub fn new(mut bridge: B, capture: C, track: Track, config: Config) -> Self {
        let inbox = Inbox::default();
        bridge.set_callback(Box::new(inbox.clone()));
        let track = track.with_history_levels(config.history_levels);
        Self {
            bridge,
            capture,
            track,
            config,
            inbox,
            observer: None,
            playback: PlaybackState::Stopped,
            record: RecordState::Idle,
            progress: 0.0,
            waveform: Vec::new(),
            last_recording: None,
            last_export: None,
            pending_preview: None,
        }
    }

    /// Also forward every engine event to `observer` after the session has
    /// handled it.
    pub fn set_observer(&mut self, observer: Box<dyn PlaybackListener>) {
        self.observer = Some(observer);
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    /// Edit the model. Nothing reaches the engine until the next
    /// [`on_play`](Self::on_play) or [`push_snapshot`](Self::push_snapshot).
    pub fn track_mut(&mut self) -> &mut Track {
        &mut self.track
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut B {
        &mut self.bridge
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.playback
    }

    pub fn record_state(&self) -> &RecordState {
        &self.record
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn waveform(&self) -> &[f32] {
        &self.waveform
    }

    pub fn last_recording(&self) -> Option<&Path> {
        self.last_recording.as_deref()
    }

    pub fn last_export(&self) -> Option<&ExportOutcome> {
        self.last_export.as_ref()
    }

    /// Seconds left in the countdown, if one is running.
    pub fn countdown(&self) -> Option<u32> {
        match self.record {
            RecordState::Pending { remaining, .. } => Some(remaining),
            _ => None,
        }
    }

    // Playback

    fn resolved_snapshot(&self) -> Result<Snapshot, PlayError> {
        let missing: Vec<LayerId> = self
            .track
            .layers()
            .iter()
            .filter(|l| l.has_pattern() && !l.has_audio())
            .map(|l| l.id)
            .collect();
        if !missing.is_empty() {
            return Err(PlayError::Unresolved(Unresolved::MissingAudio(missing)));
        }

        let snapshot = build_snapshot(&self.track);
        let playable = snapshot
            .layers
            .iter()
            .any(|l| l.pattern_blocks.iter().any(PatternBlock::is_on_grid));
        if !playable {
            return Err(PlayError::Unresolved(Unresolved::NoPlayableLayers));
        }
        Ok(snapshot)
    }

    fn send(&mut self, snapshot: &Snapshot) -> Result<(), PlayError> {
        let status = self.bridge.set_tempo(snapshot.bpm);
        if status.is_error() {
            return Err(PlayError::Engine(status));
        }
        let status = self
            .bridge
            .set_layers(&snapshot.layers, snapshot.max_used_bars);
        if status.is_error() {
            return Err(PlayError::Engine(status));
        }
        Ok(())
    }

    /// Send the current model to the engine without changing playback state.
    pub fn push_snapshot(&mut self) -> Result<(), PlayError> {
        let snapshot = self.resolved_snapshot()?;
        self.send(&snapshot)
    }

    /// Start playback from the top of the loop. Does nothing while playing.
    pub fn on_play(&mut self) -> Result<(), PlayError> {
        if self.playback == PlaybackState::Playing {
            return Ok(());
        }
        let snapshot = self.resolved_snapshot()?;

        if let Err(e) = self.send(&snapshot) {
            self.fail_safe();
            return Err(e);
        }
        let status = self.bridge.start_audio_engine();
        if status.is_error() {
            self.fail_safe();
            return Err(PlayError::Engine(status));
        }

        info!(
            "playing {} layers over {} bars at {} bpm",
            snapshot.layers.len(),
            snapshot.max_used_bars,
            snapshot.bpm
        );
        self.playback = PlaybackState::Playing;
        self.progress = 0.0;
        Ok(())
    }

    pub fn stop(&mut self) -> EngineStatus {
        let status = self.bridge.stop_audio_engine();
        self.playback = PlaybackState::Stopped;
        self.progress = 0.0;
        status
    }

    pub fn toggle_playback(&mut self) -> Result<PlaybackState, PlayError> {
        match self.playback {
            PlaybackState::Playing => {
                self.stop();
            }
            PlaybackState::Stopped => self.on_play()?,
        }
        Ok(self.playback)
    }

    fn fail_safe(&mut self) {
        self.bridge.stop_audio_engine();
        self.playback = PlaybackState::Stopped;
        self.progress = 0.0;
    }

    // Export

    fn start_render(&mut self, path: &Path) -> Result<(), PlayError> {
        let snapshot = self.resolved_snapshot()?;
        self.send(&snapshot)?;
        let total_frames = snapshot.total_frames(self.config.audio.sample_rate);
        if !self.bridge.spawn_render(path, total_frames) {
            return Err(PlayError::RenderFailed(path.to_path_buf()));
        }
        debug!("rendering {total_frames} frames to {}", path.display());
        Ok(())
    }

    /// Render the whole loop to `path` in the background. The outcome shows
    /// up in [`last_export`](Self::last_export) after a later poll.
    pub fn export_mix(&mut self, path: &Path) -> Result<(), PlayError> {
        self.start_render(path)
    }

    /// Like [`export_mix`](Self::export_mix), then load the rendered file's
    /// waveform once it is written.
    pub fn preview_mix(&mut self, path: &Path) -> Result<(), PlayError> {
        self.start_render(path)?;
        self.pending_preview = Some(path.to_path_buf());
        Ok(())
    }

    // Recording

    /// Begin the countdown. Capture starts on the tick that reaches zero, or
    /// right away when the countdown is disabled.
    pub fn start_recording(&mut self, path: &Path) -> Result<(), RecordError> {
        if self.record != RecordState::Idle {
            return Err(RecordError::Busy);
        }
        self.record = RecordState::Pending {
            remaining: self.config.countdown_secs,
            path: path.to_path_buf(),
        };
        if self.config.countdown_secs == 0 {
            return self.begin_capture();
        }
        Ok(())
    }

    /// Advance the countdown by one second.
    pub fn tick(&mut self) -> Result<(), RecordError> {
        let RecordState::Pending { remaining, .. } = &mut self.record else {
            return Ok(());
        };
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            return self.begin_capture();
        }
        Ok(())
    }

    fn begin_capture(&mut self) -> Result<(), RecordError> {
        let RecordState::Pending { path, .. } = mem::replace(&mut self.record, RecordState::Idle)
        else {
            return Ok(());
        };
        match self.capture.start(&path) {
            Ok(()) => {
                self.record = RecordState::Recording { path };
                Ok(())
            }
            Err(e) => {
                warn!("could not start recording: {e:#}");
                Err(RecordError::Capture(format!("{e:#}")))
            }
        }
    }

    /// Stop capture, or cancel a running countdown.
    pub fn stop_recording(&mut self) -> Result<PathBuf, RecordError> {
        match mem::replace(&mut self.record, RecordState::Idle) {
            RecordState::Idle => Err(RecordError::NotRecording),
            RecordState::Pending { .. } => Err(RecordError::Cancelled),
            RecordState::Recording { .. } => {
                let path = self
                    .capture
                    .stop()
                    .map_err(|e| RecordError::Capture(format!("{e:#}")))?;
                self.last_recording = Some(path.clone());
                Ok(path)
            }
        }
    }

    /// Turn the last recording into a layer covering its length in bars.
    pub fn add_recorded_layer(&mut self, name: &str) -> Result<LayerId, RecordError> {
        let path = self.last_recording.clone().ok_or(RecordError::NoRecording)?;
        let seconds = self.bridge.get_wav_duration_seconds(&path);
        if seconds < 0.0 {
            return Err(RecordError::UnreadableRecording(path));
        }

        let bars = bars_from_duration(seconds as f64, self.track.project_bpm());
        let mut layer = Layer::new(name, InstrumentType::Record)
            .with_wav(path)
            .with_length(bars)
            .with_blocks(vec![PatternBlock::new(0, bars)]);
        layer.description = "Recording".into();

        let id = self.track.add_layer(layer)?;
        self.last_recording = None;
        info!("added recording as layer {id} ({bars} bars)");
        Ok(id)
    }

    // Events

    /// Drain engine events and apply them. Call from the host's timer.
    /// Returns how many events were handled.
    pub fn poll(&mut self) -> usize {
        self.bridge.dispatch_events();
        let events = self.inbox.take();
        for event in &events {
            self.apply(event);
            if let Some(observer) = self.observer.as_deref_mut() {
                deliver(observer, event);
            }
        }
        events.len()
    }

    /// Drive the session until `stop` receives or its sender goes away.
    /// Polls every `poll_interval_ms` and advances a recording countdown
    /// once a second.
    pub fn run(&mut self, stop: &Receiver<()>) {
        let poll = crossbeam_channel::tick(self.config.poll_interval());
        let countdown = crossbeam_channel::tick(COUNTDOWN_STEP);
        info!("session loop started");
        loop {
            select! {
                recv(stop) -> _ => break,
                recv(poll) -> _ => {
                    self.poll();
                }
                recv(countdown) -> _ => {
                    if let Err(e) = self.tick() {
                        warn!("recording did not start: {e}");
                    }
                }
            }
        }
        info!("session loop stopped");
    }

    fn apply(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::Progress(fraction) => {
                if self.playback == PlaybackState::Playing {
                    self.progress = fraction.clamp(0.0, 1.0);
                }
            }
            EngineEvent::PlaybackFinished => {
                if self.playback == PlaybackState::Playing {
                    self.stop();
                }
            }
            EngineEvent::WaveformPoints(points) => {
                self.waveform = points.clone();
            }
            EngineEvent::RenderFinished { path, success } => {
                if self.pending_preview.as_deref() == Some(path.as_path()) {
                    self.pending_preview = None;
                    if *success && !self.bridge.generate_waveform_points(path) {
                        warn!("no waveform for {}", path.display());
                    }
                }
                self.last_export = Some(ExportOutcome {
                    path: path.clone(),
                    success: *success,
                });
            }
        }
    }
}

impl<B: EngineBridge, C: Capture> Drop for Session<B, C> {
    fn drop(&mut self) {
        if self.capture.is_capturing() {
            if let Err(e) = self.capture.stop() {
                warn!("recording lost on shutdown: {e:#}");
            }
        }
        self.bridge.stop_audio_engine();
    }
}
