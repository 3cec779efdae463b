//! Reply Encoding
//!
//! Handler functions return plain Rust values; [`IntoReply`] decides which
//! RESP reply each one becomes:
//!
//! | Rust value                          | Reply                     |
//! |-------------------------------------|---------------------------|
//! | `()`                                | `+OK`                     |
//! | [`Status`]                          | `+<status>`               |
//! | `String`, `&'static str`, `Bytes`   | `$<len>\r\n<data>`        |
//! | `i64`, `i32`, `u64`, `usize`, `bool`| `:<n>`                    |
//! | `Option<T>`                         | `T` or `$-1`              |
//! | `Vec<T>`                            | `*<n>` of `T`             |
//! | `BTreeMap` / `HashMap` by string    | `*<2n>` of key/value      |
//! | `RespValue`                         | as is                     |

use crate::commands::CommandError;
use crate::protocol::RespValue;
use bytes::Bytes;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

/// Converts a handler result into a wire reply.
pub trait IntoReply {
    /// Fails with [`CommandError::Internal`] when the value has no RESP form.
    fn into_reply(self) -> Result<RespValue, CommandError>;
}

/// A status reply such as `+OK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status(pub Cow<'static, str>);

impl Status {
    pub fn ok() -> Self {
        Status(Cow::Borrowed("OK"))
    }

    pub fn new(status: impl Into<Cow<'static, str>>) -> Self {
        Status(status.into())
    }
}

impl IntoReply for Status {
    fn into_reply(self) -> Result<RespValue, CommandError> {
        Ok(RespValue::simple_string(self.0.into_owned()))
    }
}

impl IntoReply for () {
    fn into_reply(self) -> Result<RespValue, CommandError> {
        Ok(RespValue::ok())
    }
}

impl IntoReply for RespValue {
    fn into_reply(self) -> Result<RespValue, CommandError> {
        Ok(self)
    }
}

impl IntoReply for String {
    fn into_reply(self) -> Result<RespValue, CommandError> {
        Ok(RespValue::bulk_string(self))
    }
}

impl IntoReply for &'static str {
    fn into_reply(self) -> Result<RespValue, CommandError> {
        Ok(RespValue::bulk_string(self))
    }
}

impl IntoReply for Bytes {
    fn into_reply(self) -> Result<RespValue, CommandError> {
        Ok(RespValue::BulkString(self))
    }
}

impl IntoReply for i64 {
    fn into_reply(self) -> Result<RespValue, CommandError> {
        Ok(RespValue::integer(self))
    }
}

impl IntoReply for i32 {
    fn into_reply(self) -> Result<RespValue, CommandError> {
        Ok(RespValue::integer(self.into()))
    }
}

impl IntoReply for bool {
    fn into_reply(self) -> Result<RespValue, CommandError> {
        Ok(RespValue::integer(self as i64))
    }
}

impl IntoReply for u64 {
    fn into_reply(self) -> Result<RespValue, CommandError> {
        i64::try_from(self)
            .map(RespValue::integer)
            .map_err(|_| CommandError::Internal(format!("integer {} does not fit a reply", self)))
    }
}

impl IntoReply for usize {
    fn into_reply(self) -> Result<RespValue, CommandError> {
        (self as u64).into_reply()
    }
}

impl<T: IntoReply> IntoReply for Option<T> {
    fn into_reply(self) -> Result<RespValue, CommandError> {
        match self {
            Some(value) => value.into_reply(),
            None => Ok(RespValue::null()),
        }
    }
}

impl<T: IntoReply> IntoReply for Vec<T> {
    fn into_reply(self) -> Result<RespValue, CommandError> {
        self.into_iter()
            .map(IntoReply::into_reply)
            .collect::<Result<Vec<_>, _>>()
            .map(RespValue::array)
    }
}

impl<T: IntoReply> IntoReply for BTreeMap<String, T> {
    fn into_reply(self) -> Result<RespValue, CommandError> {
        let pairs = self
            .into_iter()
            .map(|(k, v)| v.into_reply().map(|v| (k, v)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RespValue::from_pairs(pairs))
    }
}

/// Keys are sorted so the reply does not depend on hash order.
impl<T: IntoReply> IntoReply for HashMap<String, T> {
    fn into_reply(self) -> Result<RespValue, CommandError> {
        self.into_iter().collect::<BTreeMap<_, _>>().into_reply()
    }
}
