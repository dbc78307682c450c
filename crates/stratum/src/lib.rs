use {
    byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt},
    bytes::BytesMut,
    derive_more::Display,
    serde::{
        Deserialize, Serialize, Serializer,
        de::{self, Deserializer},
    },
    serde_json::{Value, json},
    snafu::Snafu,
    std::{
        fmt,
        io::{self, Cursor},
    },
    tokio_util::codec::{Decoder, Encoder},
};

pub use {
    codec::{AgentCodec, CodecError, Frame},
    error::{ProtocolError, StratumError},
    exmessage::{
        EX_MAGIC, ExMessage, GetNoncePrefix, MiningSetDiff, RegisterWorker, SetExtraNonce,
        SubmitResponse, SubmitShare, SubmitShareEth, UnregisterWorker, cmd,
    },
    message::{Id, Message, RpcVersion},
    status::ShareStatus,
};

/// Longest JSON line either side is allowed to send before the connection is
/// considered broken.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024;

mod codec;
mod error;
mod exmessage;
mod message;
mod status;
