//! Stream ingestion: audio sources, fixed-duration chunking, reconnection,
//! and the per-stream pipeline supervisor.

pub mod chunker;
pub mod reconnect;
pub mod source;
pub mod supervisor;

pub use chunker::ChunkProducer;
pub use reconnect::{Reconnector, ReconnectionFailed, INITIAL_DELAY, MAX_RETRIES};
pub use source::{AudioSource, SourceFactory, WavFileSource};
pub use supervisor::{StreamSupervisor, SupervisorEvent};
