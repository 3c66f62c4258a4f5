//! Render a two-layer pattern to `mix.wav` without opening an audio device.
//!
//! Usage: `cargo run -p stepmix_engine --example render_mix -- kick.wav hat.wav`

use std::path::{Path, PathBuf};

use stepmix_engine::{AudioConfig, AudioEngineBridge, EngineBridge, LayerAudioInfo};
use stepmix_transport::{LayerId, PatternBlock, frames_per_step};

fn main() -> anyhow::Result<()> {
    let args: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    let [kick, hat] = args.as_slice() else {
        anyhow::bail!("usage: render_mix <kick.wav> <hat.wav>");
    };

    let layers = vec![
        LayerAudioInfo {
            id: LayerId(1),
            wav_path: kick.clone(),
            pattern_blocks: (0..8).step_by(2).map(|s| PatternBlock::new(s, 1)).collect(),
            volume: 1.0,
            playback_rate: 1.0,
        },
        LayerAudioInfo {
            id: LayerId(2),
            wav_path: hat.clone(),
            pattern_blocks: vec![PatternBlock::new(0, 8)],
            volume: 0.6,
            playback_rate: 1.0,
        },
    ];

    let config = AudioConfig::default();
    let bars = 8;
    let bpm = 120.0;
    let total_frames = (bars as f64 * frames_per_step(bpm, config.sample_rate)) as u64;

    let mut engine = AudioEngineBridge::new(config);
    engine.set_tempo(bpm as f32);
    let status = engine.set_layers(&layers, bars);
    if status.is_error() {
        anyhow::bail!("set_layers failed: {status}");
    }

    let out = Path::new("mix.wav");
    if !engine.render_mix_to_wav(out, total_frames) {
        anyhow::bail!("render failed");
    }
    println!(
        "Rendered {total_frames} frames ({:.1} s) to {}",
        engine.get_wav_duration_seconds(out),
        out.display()
    );
    Ok(())
}
