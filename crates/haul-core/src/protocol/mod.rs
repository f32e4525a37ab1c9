//! Content-file wire protocol: messages, frame codec, and the connection
//! wrapper both peers use.

pub mod codec;
pub mod message;
pub mod transporter;

pub use codec::{decode, encode, ProtocolError, WireMessage};
pub use message::{Connection, ContentFileRequest, ContentFileResponse, RequestType, CATALOG_ID};
pub use transporter::{ContentTransporter, TransportError};
