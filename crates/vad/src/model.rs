//! VAD model abstraction and the built-in energy classifier.

/// Classifies a PCM chunk as speech/non-speech.
///
/// `classify` is synchronous and CPU-bound; the gate runs it through
/// `spawn_blocking` so inference never stalls the I/O loop.
pub trait VadModel: Send + Sync {
    /// Speech probability in [0, 1] for raw 16 kHz mono s16le PCM.
    fn classify(&self, pcm: &[u8]) -> anyhow::Result<f32>;

    /// Resets any per-stream internal state.
    fn reset(&self) {}
}

/// Energy + zero-crossing classifier.
///
/// Combines normalized RMS energy with a zero-crossing-rate band check.
/// Voiced speech lands in a moderate crossing band; broadband noise and
/// silence fall outside it.
pub struct EnergyVad {
    energy_floor: f32,
}

impl EnergyVad {
    pub fn new() -> Self {
        Self { energy_floor: 0.01 }
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new()
    }
}

impl VadModel for EnergyVad {
    fn classify(&self, pcm: &[u8]) -> anyhow::Result<f32> {
        if pcm.len() < 4 {
            return Ok(0.0);
        }

        let samples: Vec<f32> = pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect();

        let energy = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
        let rms = energy.sqrt();

        let crossings = samples
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count();
        let crossing_rate = crossings as f32 / samples.len() as f32;

        let energy_score = if rms > self.energy_floor {
            0.6 * (rms * 4.0).min(1.0)
        } else {
            0.0
        };
        // Voiced speech at 16 kHz typically crosses zero in this band.
        let crossing_score = if (0.01..0.45).contains(&crossing_rate) {
            0.4
        } else {
            0.0
        };

        Ok((energy_score + crossing_score).min(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone_pcm(freq: f32, amplitude: f32, seconds: f32) -> Vec<u8> {
        let rate = 16_000.0;
        let total = (rate * seconds) as usize;
        let mut pcm = Vec::with_capacity(total * 2);
        for i in 0..total {
            let t = i as f32 / rate;
            let s = ((t * freq * 2.0 * std::f32::consts::PI).sin() * amplitude) as i16;
            pcm.extend_from_slice(&s.to_le_bytes());
        }
        pcm
    }

    #[test]
    fn silence_scores_near_zero() {
        let vad = EnergyVad::new();
        let score = vad.classify(&vec![0u8; 8960]).unwrap();
        assert!(score < 0.1, "got {score}");
    }

    #[test]
    fn loud_tone_scores_high() {
        let vad = EnergyVad::new();
        let score = vad.classify(&tone_pcm(220.0, 20_000.0, 0.28)).unwrap();
        assert!(score >= 0.5, "got {score}");
    }

    #[test]
    fn score_stays_in_unit_interval() {
        let vad = EnergyVad::new();
        let score = vad.classify(&tone_pcm(440.0, 32_000.0, 0.28)).unwrap();
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn tiny_input_is_non_speech() {
        let vad = EnergyVad::new();
        assert_eq!(vad.classify(&[0, 0]).unwrap(), 0.0);
    }
}
