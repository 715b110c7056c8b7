//! Diarization model abstraction and the built-in clustering stand-in.

use voxsentinel_common::models::SpeakerSegment;
use voxsentinel_common::SAMPLE_RATE;

/// Produces speaker turns for one PCM window. Times are milliseconds
/// relative to the window start.
pub trait DiarizerModel: Send + Sync {
    fn diarize(&self, pcm: &[u8]) -> anyhow::Result<Vec<SpeakerSegment>>;
}

/// Degraded-mode model: no segments, so the merger labels everything
/// `SPEAKER_UNKNOWN`.
pub struct NullDiarizer;

impl DiarizerModel for NullDiarizer {
    fn diarize(&self, _pcm: &[u8]) -> anyhow::Result<Vec<SpeakerSegment>> {
        Ok(Vec::new())
    }
}

/// Frame-level feature clustering.
///
/// Frames the window, extracts coarse spectral features per frame, and
/// greedily assigns frames to running speaker centroids; consecutive
/// frames with the same assignment merge into one segment.
pub struct ClusteringDiarizer {
    frame_ms: u64,
    similarity_threshold: f32,
    max_speakers: usize,
}

#[derive(Clone, Copy)]
struct FrameFeatures {
    rms: f32,
    crossing_rate: f32,
    centroid: f32,
}

impl FrameFeatures {
    fn distance(&self, other: &FrameFeatures) -> f32 {
        let d_rms = (self.rms - other.rms).abs();
        let d_zcr = (self.crossing_rate - other.crossing_rate).abs();
        let d_cen = (self.centroid - other.centroid).abs();
        d_rms + d_zcr + d_cen
    }

    fn blend(&mut self, other: &FrameFeatures, weight: f32) {
        self.rms += (other.rms - self.rms) * weight;
        self.crossing_rate += (other.crossing_rate - self.crossing_rate) * weight;
        self.centroid += (other.centroid - self.centroid) * weight;
    }
}

impl ClusteringDiarizer {
    pub fn new() -> Self {
        Self {
            frame_ms: 250,
            similarity_threshold: 0.18,
            max_speakers: 8,
        }
    }

    fn extract(samples: &[f32]) -> Option<FrameFeatures> {
        if samples.is_empty() {
            return None;
        }
        let energy = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
        let rms = energy.sqrt();
        if rms < 0.005 {
            return None; // silence
        }
        let crossings = samples
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count();
        let crossing_rate = crossings as f32 / samples.len() as f32;

        let mut weighted = 0.0f32;
        let mut magnitude = 0.0f32;
        for (i, s) in samples.iter().enumerate() {
            let m = s.abs();
            weighted += i as f32 * m;
            magnitude += m;
        }
        let centroid = if magnitude > 0.0 {
            weighted / magnitude / samples.len() as f32
        } else {
            0.0
        };

        Some(FrameFeatures {
            rms,
            crossing_rate,
            centroid,
        })
    }
}

impl Default for ClusteringDiarizer {
    fn default() -> Self {
        Self::new()
    }
}

impl DiarizerModel for ClusteringDiarizer {
    fn diarize(&self, pcm: &[u8]) -> anyhow::Result<Vec<SpeakerSegment>> {
        let samples: Vec<f32> = pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect();

        let frame_len = (SAMPLE_RATE as u64 * self.frame_ms / 1000) as usize;
        if frame_len == 0 || samples.is_empty() {
            return Ok(Vec::new());
        }

        let mut centroids: Vec<FrameFeatures> = Vec::new();
        // (frame index, assigned speaker) for voiced frames only.
        let mut assignments: Vec<(usize, usize)> = Vec::new();

        for (index, frame) in samples.chunks(frame_len).enumerate() {
            let Some(features) = Self::extract(frame) else {
                continue;
            };

            let nearest = centroids
                .iter()
                .enumerate()
                .map(|(i, c)| (i, c.distance(&features)))
                .min_by(|a, b| a.1.total_cmp(&b.1));

            let speaker = match nearest {
                Some((i, distance)) if distance < self.similarity_threshold => {
                    centroids[i].blend(&features, 0.3);
                    i
                }
                _ if centroids.len() < self.max_speakers => {
                    centroids.push(features);
                    centroids.len() - 1
                }
                Some((i, _)) => i,
                None => {
                    centroids.push(features);
                    0
                }
            };
            assignments.push((index, speaker));
        }

        // Merge consecutive frames with the same speaker into segments.
        let mut segments: Vec<SpeakerSegment> = Vec::new();
        for (index, speaker) in assignments {
            let start_ms = index as u64 * self.frame_ms;
            let end_ms = start_ms + self.frame_ms;
            let label = format!("SPEAKER_{speaker:02}");
            match segments.last_mut() {
                Some(last) if last.speaker_id == label && last.end_ms >= start_ms => {
                    last.end_ms = end_ms;
                }
                _ => segments.push(SpeakerSegment {
                    speaker_id: label,
                    start_ms,
                    end_ms,
                }),
            }
        }
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, amplitude: f32, seconds: f32) -> Vec<u8> {
        let total = (SAMPLE_RATE as f32 * seconds) as usize;
        let mut pcm = Vec::with_capacity(total * 2);
        for i in 0..total {
            let t = i as f32 / SAMPLE_RATE as f32;
            let s = ((t * freq * 2.0 * std::f32::consts::PI).sin() * amplitude) as i16;
            pcm.extend_from_slice(&s.to_le_bytes());
        }
        pcm
    }

    #[test]
    fn silence_yields_no_segments() {
        let diarizer = ClusteringDiarizer::new();
        let segments = diarizer.diarize(&vec![0u8; 16_000 * 2]).unwrap();
        assert!(segments.is_empty());
    }

    #[test]
    fn steady_tone_is_one_speaker() {
        let diarizer = ClusteringDiarizer::new();
        let segments = diarizer.diarize(&tone(200.0, 16_000.0, 3.0)).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].speaker_id, "SPEAKER_00");
        assert_eq!(segments[0].start_ms, 0);
    }

    #[test]
    fn contrasting_tones_split_speakers() {
        let diarizer = ClusteringDiarizer::new();
        let mut pcm = tone(150.0, 8_000.0, 1.5);
        pcm.extend(tone(2_500.0, 28_000.0, 1.5));
        let segments = diarizer.diarize(&pcm).unwrap();
        let speakers: std::collections::HashSet<_> =
            segments.iter().map(|s| s.speaker_id.clone()).collect();
        assert!(speakers.len() >= 2, "expected >= 2 speakers, got {speakers:?}");
    }

    #[test]
    fn segments_are_sorted_and_contiguous_per_speaker() {
        let diarizer = ClusteringDiarizer::new();
        let segments = diarizer.diarize(&tone(300.0, 12_000.0, 2.0)).unwrap();
        for pair in segments.windows(2) {
            assert!(pair[0].start_ms <= pair[1].start_ms);
        }
    }

    #[test]
    fn null_diarizer_is_empty() {
        let segments = NullDiarizer.diarize(&[0u8; 3200]).unwrap();
        assert!(segments.is_empty());
    }
}
