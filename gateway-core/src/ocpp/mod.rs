//! OCPP-J protocol layer
//!
//! - `message`: JSON-array framing (CALL, CALLRESULT, CALLERROR)

pub mod message;

pub use message::*;
