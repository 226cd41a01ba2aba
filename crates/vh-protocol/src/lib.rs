//! vh-protocol: Wire types for vmhost
//!
//! Two streams cross process boundaries: the guest agent's newline-delimited
//! JSON protocol (info queries and the socket event stream), and the host
//! agent's status events written to its supervisor.

pub mod codec;
pub mod error;
pub mod guest;
pub mod status;

pub use codec::{JsonLinesCodec, MAX_LINE_LENGTH};
pub use error::ProtocolError;
pub use guest::{GuestEvent, GuestInfo, GuestRequest, IpPort, Proto};
pub use status::{Event, Status};
