use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use stepmix_transport::{GRID_STEPS, LayerId, PatternBlock};

/// Upper bound for a layer's linear gain.
pub const MAX_VOLUME: f32 = 2.0;

/// Category of a layer's source. Drives label and color only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentType {
    Record,
    Whistle,
    AcousticGuitar,
    Voice,
    Drums,
    Bass,
    ElectricGuitar,
    Piano,
    Synth,
    Unknown,
}

impl InstrumentType {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Record,
            1 => Self::Whistle,
            2 => Self::AcousticGuitar,
            3 => Self::Voice,
            4 => Self::Drums,
            5 => Self::Bass,
            6 => Self::ElectricGuitar,
            7 => Self::Piano,
            8 => Self::Synth,
            _ => Self::Unknown,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::Record => "Record",
            Self::Whistle => "Whistle",
            Self::AcousticGuitar => "Acoustic Guitar",
            Self::Voice => "Voice",
            Self::Drums => "Drums",
            Self::Bass => "Bass",
            Self::ElectricGuitar => "Electric Guitar",
            Self::Piano => "Piano",
            Self::Synth => "Synth",
            Self::Unknown => "Unknown",
        }
    }

    pub fn color_hex(&self) -> &'static str {
        match self {
            Self::Record | Self::Unknown => "#7A7A7A",
            Self::Whistle => "#B7A700",
            Self::AcousticGuitar => "#5F7320",
            Self::Voice => "#D14400",
            Self::Drums => "#E67E00",
            Self::Bass => "#5D1070",
            Self::ElectricGuitar => "#144D9A",
            Self::Piano => "#2A2D72",
            Self::Synth => "#2C6D2B",
        }
    }
}

/// One audio clip placed on the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: LayerId,
    pub instrument_type: InstrumentType,
    pub name: String,
    pub description: String,
    /// Overrides the instrument color when set.
    pub color_hex: Option<String>,
    /// Length in steps of a block placed by a single tap.
    pub length: u32,
    pub wav_path: PathBuf,
    /// Tempo the clip was recorded at. `None` plays at the project tempo.
    pub bpm: Option<f32>,
    pub volume: f32,
    pub(crate) pattern_blocks: Vec<PatternBlock>,
}

impl Layer {
    /// A silent layer with no audio source. The id is assigned by the track.
    pub fn new(name: impl Into<String>, instrument_type: InstrumentType) -> Self {
        Self {
            id: LayerId(0),
            instrument_type,
            name: name.into(),
            description: String::new(),
            color_hex: None,
            length: 1,
            wav_path: PathBuf::new(),
            bpm: None,
            volume: 1.0,
            pattern_blocks: Vec::new(),
        }
    }

    pub fn with_wav(mut self, path: impl Into<PathBuf>) -> Self {
        self.wav_path = path.into();
        self
    }

    pub fn with_bpm(mut self, bpm: f32) -> Self {
        self.bpm = Some(bpm);
        self
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = length.clamp(1, GRID_STEPS);
        self
    }

    pub fn with_blocks(mut self, blocks: Vec<PatternBlock>) -> Self {
        self.pattern_blocks = blocks;
        self.pattern_blocks.sort_by_key(|b| b.start);
        self
    }

    pub fn pattern_blocks(&self) -> &[PatternBlock] {
        &self.pattern_blocks
    }

    pub fn has_pattern(&self) -> bool {
        self.pattern_blocks.iter().any(PatternBlock::is_on_grid)
    }

    pub fn has_audio(&self) -> bool {
        !self.wav_path.as_os_str().is_empty()
    }

    pub fn color(&self) -> &str {
        self.color_hex
            .as_deref()
            .unwrap_or_else(|| self.instrument_type.color_hex())
    }

    /// Grid occupancy: OR of every block, clamped to the grid.
    pub fn beat_pattern(&self) -> [bool; GRID_STEPS as usize] {
        let mut pattern = [false; GRID_STEPS as usize];
        for block in &self.pattern_blocks {
            for step in block.start.min(GRID_STEPS)..block.end() {
                pattern[step as usize] = true;
            }
        }
        pattern
    }

    /// Highest active step, if any.
    pub fn last_active_step(&self) -> Option<u32> {
        self.pattern_blocks
            .iter()
            .filter(|b| b.is_on_grid())
            .map(|b| b.end() - 1)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beat_pattern_ors_overlapping_blocks() {
        let layer = Layer::new("kick", InstrumentType::Drums)
            .with_blocks(vec![PatternBlock::new(0, 4), PatternBlock::new(2, 4)]);
        let pattern = layer.beat_pattern();

        assert!(pattern[..6].iter().all(|&on| on));
        assert!(pattern[6..].iter().all(|&on| !on));
    }

    #[test]
    fn test_beat_pattern_clamps_to_grid() {
        let layer =
            Layer::new("pad", InstrumentType::Synth).with_blocks(vec![PatternBlock::new(62, 10)]);
        let pattern = layer.beat_pattern();

        assert!(pattern[62] && pattern[63]);
        assert_eq!(pattern.iter().filter(|&&on| on).count(), 2);
        assert_eq!(layer.last_active_step(), Some(63));
    }

    #[test]
    fn test_empty_layer_is_silent() {
        let layer = Layer::new("empty", InstrumentType::Record);
        assert!(!layer.has_pattern());
        assert!(!layer.has_audio());
        assert_eq!(layer.last_active_step(), None);
    }

    #[test]
    fn test_instrument_codes_and_colors() {
        assert_eq!(InstrumentType::from_code(4), InstrumentType::Drums);
        assert_eq!(InstrumentType::from_code(99), InstrumentType::Unknown);
        assert_eq!(InstrumentType::Bass.color_hex(), "#5D1070");
        assert_eq!(InstrumentType::ElectricGuitar.category(), "Electric Guitar");
    }

    #[test]
    fn test_color_override() {
        let mut layer = Layer::new("v", InstrumentType::Voice);
        assert_eq!(layer.color(), "#D14400");
        layer.color_hex = Some("#FFFFFF".into());
        assert_eq!(layer.color(), "#FFFFFF");
    }
}
