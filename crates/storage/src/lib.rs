//! Storage and audit: transcript persistence, search indexing, alert
//! records, and Merkle-anchored tamper evidence.

pub mod alert_store;
pub mod audit;
pub mod consumer;
pub mod search;
pub mod writer;

pub use alert_store::AlertStore;
pub use audit::{
    build_merkle_root, build_proof, verify_proof, AuditAnchorJob, AuditError, ProofStep,
    SidePosition, VerificationReport,
};
pub use consumer::{segment_from_fields, StorageConsumer};
pub use search::SearchIndexer;
pub use writer::TranscriptWriter;
