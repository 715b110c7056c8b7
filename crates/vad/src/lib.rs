//! Voice activity detection: per-chunk speech classification and the gate
//! that forwards speech chunks downstream.

pub mod gate;
pub mod model;
#[cfg(feature = "silero")]
pub mod silero;

pub use gate::VadGate;
pub use model::{EnergyVad, VadModel};
#[cfg(feature = "silero")]
pub use silero::SileroVad;
