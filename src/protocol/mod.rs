//! RESP Protocol Implementation
//!
//! logvault speaks RESP2, so any Redis client library or `redis-cli` can talk
//! to it.
//!
//! ## Modules
//!
//! - `types`: the `RespValue` reply type and its serialization
//! - `parser`: incremental parser for incoming bytes
//! - `request`: turns a parsed frame into a `Request`
//!
//! ## Example
//!
//! ```
//! use logvault::protocol::{parse_message, Request, RespValue};
//!
//! let data = b"*3\r\n$3\r\nSET\r\n$10\r\naccess.log\r\n$5\r\nhello\r\n";
//! let (frame, consumed) = parse_message(data).unwrap().unwrap();
//! assert_eq!(consumed, data.len());
//!
//! let request = Request::from_frame(frame, "127.0.0.1:50000").unwrap();
//! assert_eq!(request.name, "SET");
//! assert_eq!(RespValue::ok().serialize(), b"+OK\r\n");
//! ```

pub mod parser;
pub mod request;
pub mod types;

pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use request::Request;
pub use types::RespValue;
