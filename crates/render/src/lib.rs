mod mixer;
mod wav;

pub use mixer::{MixSnapshot, Mixer, Voice};
pub use wav::{render_to_buffer, render_to_wav};
