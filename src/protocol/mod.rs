mod codec;
mod resp;

pub use codec::{encode_command, RespCodec, DEFAULT_MAX_DEPTH};
pub use resp::RespValue;
