//! Scale wire protocol: STX/ETX framing around an eight-character ASCII
//! payload.

mod frame;
mod payload;

pub use frame::{
    encode_frame, FrameDecoder, ETX, MAX_UNFRAMED_BYTES, MAX_UNTERMINATED_BYTES, STX,
};
pub use payload::{decode_payload, MIN_PAYLOAD_LEN, WEIGHT_FIELD_LEN};
