// Consent module: records, wire codec, commands

pub mod codec;
pub mod summary;
pub mod types;
pub mod writer;

pub use codec::{ConsentCodec, ProtocolError};
pub use summary::{describe_consent, Summarizer, SUMMARY_FALLBACK};
pub use types::{ConsentCode, ConsentId, ConsentRecord, DeviceConsentEntry};
pub use writer::ConsentWriter;
