//! corebus core: payload and result types, wire envelopes, subject naming,
//! and weighted connection selection.

pub mod envelope;
pub mod selector;
pub mod subject;
pub mod types;

pub use envelope::{Metadata, ProtocolError, RequestEnvelope, ResponseEnvelope};
pub use selector::WeightedSelector;
pub use subject::{parse_subject, subject, SubjectKind};
pub use types::{Map, Res, Value, ERROR_CODE, OK_CODE};
