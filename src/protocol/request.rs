//! Request frames.
//!
//! A request is a multi-bulk of bulk strings: the command name followed by its
//! arguments. Anything else arriving from a client is a protocol error.

use crate::protocol::{ParseError, RespValue};
use bytes::Bytes;
use std::fmt;

/// One command sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Command name as sent; matching is case-insensitive
    pub name: String,
    /// Arguments after the command name
    pub args: Vec<Bytes>,
    /// Peer label of the connection that sent the request
    pub client: String,
}

impl Request {
    pub fn new(name: impl Into<String>, args: Vec<Bytes>, client: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args,
            client: client.into(),
        }
    }

    /// Builds a request from a parsed frame.
    pub fn from_frame(frame: RespValue, client: &str) -> Result<Self, ParseError> {
        let RespValue::Array(items) = frame else {
            return Err(ParseError::Protocol(
                "expected a multibulk request".to_string(),
            ));
        };

        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            match item {
                RespValue::BulkString(b) => parts.push(b),
                other => {
                    return Err(ParseError::Protocol(format!(
                        "expected bulk string in request, got {:?}",
                        other
                    )))
                }
            }
        }

        let mut parts = parts.into_iter();
        let Some(name) = parts.next() else {
            return Err(ParseError::Protocol("empty request".to_string()));
        };
        // A name that is not UTF-8 cannot match any command; the registry
        // reports it as unknown.
        let name = String::from_utf8_lossy(&name).into_owned();

        Ok(Self {
            name,
            args: parts.collect(),
            client: client.to_string(),
        })
    }
}

/// Monitor-style rendering: `[client] "NAME" "arg1" "arg2"`.
impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] \"{}\"", self.client, self.name)?;
        for arg in &self.args {
            write!(f, " \"{}\"", String::from_utf8_lossy(arg).escape_debug())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> RespValue {
        RespValue::bulk_string(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn test_from_frame() {
        let frame = RespValue::array(vec![bulk("set"), bulk("a.log"), bulk("line")]);
        let request = Request::from_frame(frame, "127.0.0.1:5000").unwrap();
        assert_eq!(request.name, "set");
        assert_eq!(request.args, vec![Bytes::from("a.log"), Bytes::from("line")]);
        assert_eq!(request.client, "127.0.0.1:5000");
    }

    #[test]
    fn test_rejects_non_array() {
        let err = Request::from_frame(RespValue::ok(), "c").unwrap_err();
        assert!(matches!(err, ParseError::Protocol(_)));
    }

    #[test]
    fn test_rejects_empty_and_non_bulk() {
        assert!(Request::from_frame(RespValue::array(vec![]), "c").is_err());
        assert!(Request::from_frame(RespValue::Null, "c").is_err());

        let frame = RespValue::array(vec![bulk("PING"), RespValue::integer(1)]);
        assert!(Request::from_frame(frame, "c").is_err());
    }

    #[test]
    fn test_non_utf8_name_is_still_a_request() {
        let frame = RespValue::array(vec![RespValue::bulk_string(&b"\xffGET"[..])]);
        let request = Request::from_frame(frame, "c").unwrap();
        assert_eq!(request.name, "\u{fffd}GET");
        assert!(request.args.is_empty());
    }

    #[test]
    fn test_display_monitor_line() {
        let request = Request::new(
            "SET",
            vec![Bytes::from("a.log"), Bytes::from("say \"hi\"")],
            "peer",
        );
        assert_eq!(request.to_string(), r#"[peer] "SET" "a.log" "say \"hi\"""#);
    }
}
