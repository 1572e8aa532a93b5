//! Predictor core: canonical message envelope, metric records, and the JSON /
//! `MsgPack` wire codecs shared by both serving transports.

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{JsonCodec, MsgPackCodec, WireCodec, WireForm};
pub use error::{CodecError, MetricError};
pub use messages::{
    Feedback, Message, MessageList, Meta, MetricRecord, MetricType, Payload, PayloadKind, Status,
    StatusBody, Tensor,
};
