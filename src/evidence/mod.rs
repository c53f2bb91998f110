//! Session evidence ledger.
//!
//! Every supervision session appends its run transitions and terminal
//! outcomes to `evidence/sessions/<session_id>/events.jsonl`, next to a
//! `session.json` manifest. The ledger is the durable answer to "what
//! happened to run X, and why".

pub mod export;
pub mod lifecycle;
pub mod record;
pub mod store;
pub mod writer;

pub use export::{EvidenceExporter, EvidenceSessionExport, SessionStatus};
pub use lifecycle::{SessionEvent, SessionEventType};
pub use record::{EvidenceRecord, EvidenceSessionMetadata, EVIDENCE_SCHEMA_VERSION, LIFECYCLE_KIND};
pub use store::{
    EvidenceError, EvidenceResult, EvidenceStore, EvidenceStoreConfig, DEFAULT_RETENTION_DAYS,
};
pub use writer::{generate_session_id, EvidenceWriter, RunCompletion};
