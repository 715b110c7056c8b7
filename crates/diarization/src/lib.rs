//! Speaker diarization: windowed segment detection over speech chunks and
//! the merger that joins speaker turns with transcript tokens.

pub mod accumulator;
pub mod merger;
pub mod model;

pub use accumulator::DiarizationAccumulator;
pub use merger::{SpeakerMergeWorker, SpeakerMerger, SPEAKER_UNKNOWN};
pub use model::{ClusteringDiarizer, DiarizerModel, NullDiarizer};
