//! Wire layer shared by both ends of every RPC connection.
//!
//! - **protocol**: request/response frames and the reserved stop/ping names
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
