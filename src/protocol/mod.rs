//! Carrier protocol spoken between a tunnel and its relay
//!
//! A carrier connection starts with a handshake
//! (`Hello` -> `Challenge` -> `Auth` -> `Ack`) and then carries
//! multiplexed [`Frame`]s.

mod cipher;
mod codec;
mod digest;
mod types;

pub use cipher::{is_supported_algo, supported_algos};
pub use codec::{
    decode_frame, encode_frame, framed, read_hello, read_message, write_message, CarrierFramed,
    MAX_FRAME_LEN,
};
pub use digest::{digest, random_digest, random_key};
pub use types::{
    Ack, Auth, Challenge, Digest, Frame, Hello, Protocol, SharingMode, StreamId,
    CURRENT_PROTO_VERSION, HASH_WIDTH_IN_BYTES,
};
