//! Silero VAD via ONNX Runtime.
//!
//! The model keeps recurrent state across frames; a mutex serializes
//! inference, which is fine because each gate owns its own model instance.

use std::sync::Mutex;

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;

use crate::model::VadModel;

const SAMPLE_RATE: i64 = 16_000;
const STATE_LEN: usize = 2 * 1 * 128;

pub struct SileroVad {
    inner: Mutex<Inner>,
}

struct Inner {
    session: Session,
    state: Vec<f32>,
}

impl SileroVad {
    pub fn load(model_path: &str) -> anyhow::Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(model_path)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                session,
                state: vec![0.0; STATE_LEN],
            }),
        })
    }
}

impl VadModel for SileroVad {
    fn classify(&self, pcm: &[u8]) -> anyhow::Result<f32> {
        let samples: Vec<f32> = pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect();
        if samples.is_empty() {
            return Ok(0.0);
        }

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("silero state poisoned"))?;

        let frame_len = samples.len();
        let input = Tensor::from_array(([1usize, frame_len], samples))?;
        let sr = Tensor::from_array(([1usize], vec![SAMPLE_RATE]))?;
        let state = Tensor::from_array(([2usize, 1, 128], inner.state.clone()))?;

        let outputs = inner.session.run(ort::inputs![
            "input" => input,
            "sr" => sr,
            "state" => state,
        ])?;

        let (_, probs) = outputs["output"].try_extract_tensor::<f32>()?;
        let score = probs.first().copied().unwrap_or(0.0);

        let (_, new_state) = outputs["stateN"].try_extract_tensor::<f32>()?;
        inner.state.copy_from_slice(new_state);

        Ok(score.clamp(0.0, 1.0))
    }

    fn reset(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.state.fill(0.0);
        }
    }
}
