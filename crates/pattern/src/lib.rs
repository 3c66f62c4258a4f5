mod history;
mod layer;
mod track;

pub use history::History;
pub use layer::{InstrumentType, Layer, MAX_VOLUME};
pub use track::{DEFAULT_BPM, MAX_BPM, MIN_BPM, PatternError, Track};

pub use stepmix_transport::{GRID_STEPS, LayerId, PatternBlock};
