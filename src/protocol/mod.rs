//! Control protocol: message model, framing and request correlation

pub mod codec;
pub mod correlator;
pub mod message;

pub use codec::MessageCodec;
pub use correlator::{Completion, MessageCorrelator, MessageSink, RequestId};
pub use message::{Message, MessageKind, MessageType, ResultCode, Tag, Tlv, TlvAccess, TlvValue};
