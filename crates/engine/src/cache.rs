use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use log::debug;
use rayon::prelude::*;
use stepmix_transport::AudioArc;

struct Entry {
    modified: Option<SystemTime>,
    audio: AudioArc,
}

/// Decoded clips keyed by path and target rate. An entry is reused until the
/// file's modification time changes.
#[derive(Default)]
pub struct DecodeCache {
    entries: HashMap<(PathBuf, u32), Entry>,
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl DecodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn fresh(&self, path: &Path, sample_rate: u32) -> Option<AudioArc> {
        let entry = self.entries.get(&(path.to_path_buf(), sample_rate))?;
        (entry.modified == modified(path)).then(|| entry.audio.clone())
    }

    /// Clips for every path, in order, decoding misses in parallel.
    /// Fails as a whole if any file cannot be decoded.
    pub fn load_all(&mut self, paths: &[&Path], sample_rate: u32) -> anyhow::Result<Vec<AudioArc>> {
        let mut misses: Vec<&Path> = paths
            .iter()
            .copied()
            .filter(|p| self.fresh(p, sample_rate).is_none())
            .collect();
        misses.sort();
        misses.dedup();

        let decoded: Vec<(PathBuf, Option<SystemTime>, AudioArc)> = misses
            .par_iter()
            .map(|path| {
                let stamp = modified(path);
                let audio = stepmix_decode::decode_resampled(path, sample_rate)
                    .with_context(|| format!("loading layer audio {}", path.display()))?;
                Ok((path.to_path_buf(), stamp, audio))
            })
            .collect::<anyhow::Result<_>>()?;

        for (path, modified, audio) in decoded {
            debug!("cached {} at {} Hz", path.display(), sample_rate);
            self.entries
                .insert((path, sample_rate), Entry { modified, audio });
        }

        paths
            .iter()
            .map(|p| {
                self.fresh(p, sample_rate)
                    .ok_or_else(|| anyhow::anyhow!("{} changed while loading", p.display()))
            })
            .collect()
    }
}
