use std::path::PathBuf;

use log::debug;
use serde::{Deserialize, Serialize};
use stepmix_transport::{GRID_STEPS, LayerId, PatternBlock};

use crate::history::History;
use crate::layer::{Layer, MAX_VOLUME};

pub const DEFAULT_BPM: f32 = 120.0;
pub const MIN_BPM: f32 = 20.0;
pub const MAX_BPM: f32 = 300.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatternError {
    #[error("unknown layer {0}")]
    UnknownLayer(LayerId),

    #[error("step {0} is outside the grid")]
    StepOutOfRange(u32),

    #[error("repeat interval must be positive, got {0}")]
    InvalidInterval(i32),

    #[error("layer {layer} has no block starting at step {start}")]
    SeedBlockNotFound { layer: LayerId, start: u32 },

    #[error("block {start}+{length} does not fit the grid")]
    InvalidBlock { start: u32, length: u32 },

    #[error("tempo must be a positive finite number, got {0}")]
    InvalidTempo(f32),
}

/// Ordered layers sharing one project tempo.
///
/// Every edit records the previous layer list in the undo history. Tempo
/// changes are not undoable. Nothing here talks to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub name: String,
    project_bpm: f32,
    layers: Vec<Layer>,
    next_id: u32,
    #[serde(skip)]
    history: History<Vec<Layer>>,
}

impl Default for Track {
    fn default() -> Self {
        Self::new("Untitled", DEFAULT_BPM)
    }
}

impl Track {
    pub fn new(name: impl Into<String>, project_bpm: f32) -> Self {
        Self {
            name: name.into(),
            project_bpm: clamp_bpm(project_bpm),
            layers: Vec::new(),
            next_id: 1,
            history: History::default(),
        }
    }

    pub fn with_history_levels(mut self, levels: usize) -> Self {
        self.history = History::new(levels);
        self
    }

    pub fn project_bpm(&self) -> f32 {
        self.project_bpm
    }

    pub fn set_project_bpm(&mut self, bpm: f32) -> Result<(), PatternError> {
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(PatternError::InvalidTempo(bpm));
        }
        self.project_bpm = clamp_bpm(bpm);
        debug!("project tempo set to {}", self.project_bpm);
        Ok(())
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Append a layer under a fresh id.
    pub fn add_layer(&mut self, mut layer: Layer) -> Result<LayerId, PatternError> {
        if let Some(bad) = layer.pattern_blocks.iter().find(|b| !b.is_on_grid()) {
            return Err(PatternError::InvalidBlock {
                start: bad.start,
                length: bad.length,
            });
        }

        let id = LayerId(self.next_id);
        self.next_id += 1;
        layer.id = id;
        layer.volume = clamp_volume(layer.volume);
        layer.length = layer.length.clamp(1, GRID_STEPS);

        self.checkpoint();
        self.layers.push(layer);
        debug!("added layer {id}");
        Ok(id)
    }

    pub fn delete_layer(&mut self, id: LayerId) -> Result<Layer, PatternError> {
        let index = self.index_of(id)?;
        self.checkpoint();
        Ok(self.layers.remove(index))
    }

    /// Flip exactly one grid step, splitting or growing blocks as needed.
    pub fn toggle_step(&mut self, id: LayerId, step: u32) -> Result<bool, PatternError> {
        if step >= GRID_STEPS {
            return Err(PatternError::StepOutOfRange(step));
        }
        let index = self.index_of(id)?;
        self.checkpoint();

        let blocks = &mut self.layers[index].pattern_blocks;
        let now_active = if blocks.iter().any(|b| b.contains(step)) {
            clear_step(blocks, step);
            false
        } else {
            set_step(blocks, step);
            true
        };
        blocks.sort_by_key(|b| b.start);
        Ok(now_active)
    }

    /// Tap a whole block: remove the block under `step`, or place a block of
    /// the layer's default length there if it overlaps nothing.
    pub fn toggle_block(&mut self, id: LayerId, step: u32) -> Result<bool, PatternError> {
        if step >= GRID_STEPS {
            return Err(PatternError::StepOutOfRange(step));
        }
        let index = self.index_of(id)?;
        let layer = &self.layers[index];

        if let Some(pos) = layer.pattern_blocks.iter().position(|b| b.contains(step)) {
            self.checkpoint();
            self.layers[index].pattern_blocks.remove(pos);
            return Ok(false);
        }

        let length = layer.length.min(GRID_STEPS - step);
        let candidate = PatternBlock::new(step, length);
        let overlaps = layer
            .pattern_blocks
            .iter()
            .any(|b| candidate.start < b.end() && b.start < candidate.end());
        if overlaps {
            return Ok(false);
        }

        self.checkpoint();
        let blocks = &mut self.layers[index].pattern_blocks;
        blocks.push(candidate);
        blocks.sort_by_key(|b| b.start);
        Ok(true)
    }

    /// Replace the layer's pattern with copies of the block at `start`
    /// repeated every `interval` steps until the grid ends.
    pub fn apply_auto_repeat(
        &mut self,
        id: LayerId,
        start: u32,
        interval: i32,
    ) -> Result<(), PatternError> {
        if interval <= 0 {
            return Err(PatternError::InvalidInterval(interval));
        }
        let index = self.index_of(id)?;
        let seed = self.layers[index]
            .pattern_blocks
            .iter()
            .find(|b| b.start == start && b.is_on_grid())
            .copied()
            .ok_or(PatternError::SeedBlockNotFound { layer: id, start })?;

        let blocks: Vec<PatternBlock> = (seed.start..GRID_STEPS)
            .step_by(interval as usize)
            .map(|s| PatternBlock::new(s, seed.length.min(GRID_STEPS - s)))
            .collect();

        self.checkpoint();
        debug!("auto-repeat on {id}: {} blocks every {interval}", blocks.len());
        self.layers[index].pattern_blocks = blocks;
        Ok(())
    }

    pub fn reset_pattern(&mut self, id: LayerId) -> Result<(), PatternError> {
        let index = self.index_of(id)?;
        self.checkpoint();
        self.layers[index].pattern_blocks.clear();
        Ok(())
    }

    pub fn set_volume(&mut self, id: LayerId, volume: f32) -> Result<(), PatternError> {
        let index = self.index_of(id)?;
        self.checkpoint();
        self.layers[index].volume = clamp_volume(volume);
        Ok(())
    }

    /// Set or clear the layer's source tempo. Non-positive values clear it.
    pub fn set_source_bpm(&mut self, id: LayerId, bpm: Option<f32>) -> Result<(), PatternError> {
        let index = self.index_of(id)?;
        self.checkpoint();
        self.layers[index].bpm = bpm.filter(|b| b.is_finite() && *b > 0.0);
        Ok(())
    }

    pub fn set_wav_path(
        &mut self,
        id: LayerId,
        path: impl Into<PathBuf>,
    ) -> Result<(), PatternError> {
        let index = self.index_of(id)?;
        self.checkpoint();
        self.layers[index].wav_path = path.into();
        Ok(())
    }

    pub fn undo(&mut self) -> bool {
        let current = self.layers.clone();
        match self.history.undo(current) {
            Some(previous) => {
                self.layers = previous;
                true
            }
            None => false,
        }
    }

    pub fn redo(&mut self) -> bool {
        let current = self.layers.clone();
        match self.history.redo(current) {
            Some(next) => {
                self.layers = next;
                true
            }
            None => false,
        }
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Block starts per layer as a JSON array of arrays, e.g. `[[0,8],[4]]`.
    pub fn bars_json(&self) -> String {
        let bars: Vec<Vec<u32>> = self
            .layers
            .iter()
            .map(|l| l.pattern_blocks.iter().map(|b| b.start).collect())
            .collect();
        // Vec<Vec<u32>> always serializes
        serde_json::to_string(&bars).unwrap_or_else(|_| "[]".to_string())
    }

    fn index_of(&self, id: LayerId) -> Result<usize, PatternError> {
        self.layers
            .iter()
            .position(|l| l.id == id)
            .ok_or(PatternError::UnknownLayer(id))
    }

    fn checkpoint(&mut self) {
        self.history.record(self.layers.clone());
    }
}

fn clamp_bpm(bpm: f32) -> f32 {
    if bpm.is_finite() {
        bpm.clamp(MIN_BPM, MAX_BPM)
    } else {
        DEFAULT_BPM
    }
}

fn clamp_volume(volume: f32) -> f32 {
    if volume.is_finite() {
        volume.clamp(0.0, MAX_VOLUME)
    } else {
        1.0
    }
}

/// Remove `step` from every block covering it.
///
/// ```text
/// before: [start ...... step ...... end)
/// after:  [start, step)      [step+1, end)
/// ```
fn clear_step(blocks: &mut Vec<PatternBlock>, step: u32) {
    let mut result = Vec::with_capacity(blocks.len() + 1);
    for block in blocks.drain(..) {
        if !block.contains(step) {
            result.push(block);
            continue;
        }
        let end = block.end();
        if step > block.start {
            result.push(PatternBlock::new(block.start, step - block.start));
        }
        if end > step + 1 {
            result.push(PatternBlock::new(step + 1, end - step - 1));
        }
    }
    *blocks = result;
}

/// Mark an inactive `step`, growing a neighbouring block when one touches it.
fn set_step(blocks: &mut Vec<PatternBlock>, step: u32) {
    let left = blocks.iter().position(|b| b.end() == step && b.is_on_grid());
    let right = blocks.iter().position(|b| b.start == step + 1);

    match (left, right) {
        (Some(l), Some(r)) => {
            let right_end = blocks[r].end();
            blocks[l].length = right_end - blocks[l].start;
            blocks.remove(r);
        }
        (Some(l), None) => blocks[l].length = step + 1 - blocks[l].start,
        (None, Some(r)) => {
            let end = blocks[r].end();
            blocks[r] = PatternBlock::new(step, end - step);
        }
        (None, None) => blocks.push(PatternBlock::new(step, 1)),
    }
}
