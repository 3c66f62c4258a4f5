pub mod config;
pub mod session;

pub use config::{Config, ConfigError};
pub use session::{
    ExportOutcome, PlayError, PlaybackState, RecordError, RecordState, Session, Unresolved,
};

pub use stepmix_engine::{
    AudioEngineBridge, Capture, EngineBridge, EngineStatus, InputRecorder, PlaybackListener,
};
pub use stepmix_pattern::{InstrumentType, Layer, PatternError, Track};
pub use stepmix_scheduler::{Snapshot, build_snapshot};
pub use stepmix_transport::{AudioConfig, EngineEvent, LayerId, PatternBlock};
