//! Canonical message model: envelopes, payloads, metric records and their
//! shared serde wire forms.
//!
//! The canonical types (`Message`, `Feedback`, `MessageList`) hold only
//! validated data. The `wire` structs carry the camelCase JSON field names and
//! are shared by the JSON and `MsgPack` codecs; converting wire to canonical is
//! where the envelope invariants are checked.

pub mod envelope;
pub mod metric;
pub mod payload;
pub mod wire;

pub use envelope::{Feedback, Message, MessageList, Meta, Status, StatusBody, StatusFlag};
pub use metric::{MetricRecord, MetricType};
pub use payload::{Payload, PayloadKind, Tensor};
pub use wire::{DecodeOptions, WireData, WireFeedback, WireMessage, WireMessageList, WireTensor};
