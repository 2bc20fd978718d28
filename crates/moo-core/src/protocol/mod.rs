//! MOO/1 frame types, the text codec, and the id counter.

pub mod codec;
pub mod frame;
pub mod sequence;

pub use codec::{decode_frame, encode_frame, ProtocolError};
pub use frame::{Body, Frame, Verb};
pub use sequence::SequenceCounter;
