//! Command Registry
//!
//! Maps command names to handler functions. Commands are registered
//! explicitly, so only functions that were meant to be wire-visible ever are:
//!
//! ```ignore
//! let registry = CommandRegistry::builder(Arc::clone(&handler))
//!     .register("ping", ArchiveHandler::ping)?
//!     .register("set", ArchiveHandler::set)?
//!     .build();
//! ```
//!
//! A handler function takes the shared handler as `Arc<H>` followed by up to
//! three arguments implementing [`FromArg`], and returns a future resolving
//! to `Result<T, CommandError>` with `T: IntoReply`. The argument types decide
//! the arity: every argument is required except trailing `Option<_>`s.
//!
//! ## Dispatch
//!
//! ```text
//! Request ──> lookup (lower-cased) ──> arity check ──> decode args ──> call
//!               │                        │                 │             │
//!               ▼                        ▼                 ▼             ▼
//!         unknown command        wrong # of args     invalid arg   IntoReply
//! ```

use crate::commands::reply::IntoReply;
use crate::commands::CommandError;
use crate::protocol::{Request, RespValue};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// Future returned by a bound command.
pub type CommandFuture = BoxFuture<'static, Result<RespValue, CommandError>>;

/// Errors raised while building a registry. These are startup failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid command name '{0}'")]
    InvalidName(String),

    #[error("command '{0}' registered twice")]
    Duplicate(String),

    #[error("command '{0}' has a required argument after an optional one")]
    OptionalBeforeRequired(String),
}

/// Decodes one request argument.
///
/// `arg` is `None` only for optional arguments the client left out.
pub trait FromArg: Sized {
    /// Whether the argument must be present.
    const REQUIRED: bool = true;

    fn from_arg(arg: Option<&Bytes>) -> Result<Self, CommandError>;
}

fn missing() -> CommandError {
    CommandError::Internal("required argument missing after arity check".to_string())
}

impl FromArg for Bytes {
    fn from_arg(arg: Option<&Bytes>) -> Result<Self, CommandError> {
        arg.cloned().ok_or_else(missing)
    }
}

impl FromArg for String {
    fn from_arg(arg: Option<&Bytes>) -> Result<Self, CommandError> {
        let arg = arg.ok_or_else(missing)?;
        std::str::from_utf8(arg)
            .map(str::to_string)
            .map_err(|_| CommandError::InvalidArgument("value is not valid UTF-8"))
    }
}

impl FromArg for i64 {
    fn from_arg(arg: Option<&Bytes>) -> Result<Self, CommandError> {
        let arg = arg.ok_or_else(missing)?;
        std::str::from_utf8(arg)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(CommandError::InvalidArgument(
                "value is not an integer or out of range",
            ))
    }
}

impl<T: FromArg> FromArg for Option<T> {
    const REQUIRED: bool = false;

    fn from_arg(arg: Option<&Bytes>) -> Result<Self, CommandError> {
        match arg {
            Some(_) => T::from_arg(arg).map(Some),
            None => Ok(None),
        }
    }
}

/// A function that can be bound as a command.
///
/// Implemented for `Fn(Arc<H>, A1, .., An) -> impl Future` with `n <= 3`.
pub trait CommandFn<H, Args>: Send + Sync + 'static {
    /// `REQUIRED` flag of every declared argument, in order.
    fn params() -> Vec<bool>;

    /// Decodes `args` and starts the call. Decode failures are returned
    /// without invoking the function.
    fn call(&self, handler: Arc<H>, args: &[Bytes]) -> Result<CommandFuture, CommandError>;
}

macro_rules! impl_command_fn {
    ($($arg:ident),*) => {
        impl<H, F, Fut, T, $($arg,)*> CommandFn<H, ($($arg,)*)> for F
        where
            H: Send + Sync + 'static,
            F: Fn(Arc<H>, $($arg),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<T, CommandError>> + Send + 'static,
            T: IntoReply,
            $($arg: FromArg,)*
        {
            fn params() -> Vec<bool> {
                vec![$(<$arg as FromArg>::REQUIRED),*]
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn call(&self, handler: Arc<H>, args: &[Bytes]) -> Result<CommandFuture, CommandError> {
                let mut args = args.iter();
                $(let $arg = <$arg as FromArg>::from_arg(args.next())?;)*
                let fut = (self)(handler, $($arg),*);
                Ok(Box::pin(async move { fut.await.and_then(IntoReply::into_reply) }))
            }
        }
    };
}

impl_command_fn!();
impl_command_fn!(A1);
impl_command_fn!(A1, A2);
impl_command_fn!(A1, A2, A3);

type BoundFn<H> = Box<dyn Fn(Arc<H>, &[Bytes]) -> Result<CommandFuture, CommandError> + Send + Sync>;

/// One registered command.
struct Command<H> {
    name: String,
    min_args: usize,
    max_args: usize,
    call: BoundFn<H>,
}

impl<H> fmt::Debug for Command<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("min_args", &self.min_args)
            .field("max_args", &self.max_args)
            .finish()
    }
}

/// Collects commands for a [`CommandRegistry`].
pub struct RegistryBuilder<H> {
    handler: Arc<H>,
    commands: HashMap<String, Command<H>>,
}

impl<H> fmt::Debug for RegistryBuilder<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("RegistryBuilder")
            .field("commands", &names)
            .finish()
    }
}

impl<H: Send + Sync + 'static> RegistryBuilder<H> {
    /// Binds `f` under `name` (matched case-insensitively).
    pub fn register<Args, F>(mut self, name: &str, f: F) -> Result<Self, RegistryError>
    where
        Args: 'static,
        F: CommandFn<H, Args>,
    {
        if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }

        let lower = name.to_ascii_lowercase();
        if self.commands.contains_key(&lower) {
            return Err(RegistryError::Duplicate(lower));
        }

        let params = <F as CommandFn<H, Args>>::params();
        let min_args = params.iter().take_while(|required| **required).count();
        if params[min_args..].iter().any(|required| *required) {
            return Err(RegistryError::OptionalBeforeRequired(lower));
        }

        let command = Command {
            name: lower.clone(),
            min_args,
            max_args: params.len(),
            call: Box::new(move |handler: Arc<H>, args: &[Bytes]| {
                CommandFn::<H, Args>::call(&f, handler, args)
            }),
        };
        self.commands.insert(lower, command);
        Ok(self)
    }

    pub fn build(self) -> CommandRegistry<H> {
        CommandRegistry {
            handler: self.handler,
            commands: self.commands,
        }
    }
}

/// Immutable name-to-command dispatch table bound to one handler.
pub struct CommandRegistry<H> {
    handler: Arc<H>,
    commands: HashMap<String, Command<H>>,
}

impl<H> fmt::Debug for CommandRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

impl<H: Send + Sync + 'static> CommandRegistry<H> {
    pub fn builder(handler: Arc<H>) -> RegistryBuilder<H> {
        RegistryBuilder {
            handler,
            commands: HashMap::new(),
        }
    }

    /// Runs `request` and returns the reply to send. Never fails: every
    /// command-level error becomes an error reply.
    pub async fn apply(&self, request: &Request) -> RespValue {
        match self.dispatch(request).await {
            Ok(reply) => reply,
            Err(e) => {
                if let CommandError::Internal(detail) = &e {
                    error!(client = %request.client, command = %request.name, detail = %detail, "internal command error");
                } else {
                    debug!(client = %request.client, command = %request.name, error = %e, "command failed");
                }
                e.to_reply()
            }
        }
    }

    /// Runs `request`, keeping the error typed.
    pub async fn dispatch(&self, request: &Request) -> Result<RespValue, CommandError> {
        let Some(command) = self.commands.get(&request.name.to_ascii_lowercase()) else {
            return Err(CommandError::UnknownCommand(request.name.clone()));
        };

        let argc = request.args.len();
        if argc < command.min_args || argc > command.max_args {
            return Err(CommandError::WrongArity(command.name.clone()));
        }

        debug!("{:.6} {}", unix_time(), request);

        let fut = (command.call)(Arc::clone(&self.handler), &request.args)?;
        fut.await
    }
}

impl<H> CommandRegistry<H> {
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(&name.to_ascii_lowercase())
    }

    /// `(min, max)` argument count of `name`.
    pub fn arity(&self, name: &str) -> Option<(usize, usize)> {
        self.commands
            .get(&name.to_ascii_lowercase())
            .map(|c| (c.min_args, c.max_args))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

fn unix_time() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::reply::Status;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        calls: AtomicUsize,
    }

    impl Counter {
        async fn incr(self: Arc<Self>, by: i64) -> Result<i64, CommandError> {
            let before = self.calls.fetch_add(1, Ordering::SeqCst) as i64;
            Ok(before + by)
        }

        async fn echo(self: Arc<Self>, first: String, rest: Option<String>) -> Result<String, CommandError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(match rest {
                Some(rest) => format!("{first} {rest}"),
                None => first,
            })
        }

        async fn nothing(self: Arc<Self>) -> Result<(), CommandError> {
            Ok(())
        }

        async fn status(self: Arc<Self>) -> Result<Status, CommandError> {
            Ok(Status::new("QUEUED"))
        }

        async fn fail(self: Arc<Self>) -> Result<String, CommandError> {
            Err(CommandError::Param("error params".to_string()))
        }

        async fn bad_order(self: Arc<Self>, _a: Option<String>, _b: String) -> Result<(), CommandError> {
            Ok(())
        }
    }

    fn registry() -> CommandRegistry<Counter> {
        CommandRegistry::builder(Arc::new(Counter::default()))
            .register("INCR", Counter::incr)
            .and_then(|b| b.register("echo", Counter::echo))
            .and_then(|b| b.register("nothing", Counter::nothing))
            .and_then(|b| b.register("status", Counter::status))
            .and_then(|b| b.register("fail", Counter::fail))
            .unwrap()
            .build()
    }

    fn request(parts: &[&str]) -> Request {
        Request::new(
            parts[0],
            parts[1..].iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect(),
            "test",
        )
    }

    #[tokio::test]
    async fn test_names_are_lowercased_and_case_insensitive() {
        let registry = registry();
        assert_eq!(registry.names(), vec!["echo", "fail", "incr", "nothing", "status"]);

        let reply = registry.apply(&request(&["InCr", "10"])).await;
        assert_eq!(reply, RespValue::integer(10));
    }

    #[tokio::test]
    async fn test_arity_from_signature() {
        let registry = registry();
        assert_eq!(registry.arity("incr"), Some((1, 1)));
        assert_eq!(registry.arity("echo"), Some((1, 2)));
        assert_eq!(registry.arity("nothing"), Some((0, 0)));

        let reply = registry.apply(&request(&["echo"])).await;
        assert_eq!(
            reply,
            RespValue::error("ERR wrong number of arguments for 'echo' command")
        );
        let reply = registry.apply(&request(&["echo", "a", "b", "c"])).await;
        assert!(reply.is_error());

        let reply = registry.apply(&request(&["echo", "a", "b"])).await;
        assert_eq!(reply, RespValue::bulk_string("a b"));
        let reply = registry.apply(&request(&["echo", "a"])).await;
        assert_eq!(reply, RespValue::bulk_string("a"));
    }

    #[tokio::test]
    async fn test_decode_failure_skips_handler() {
        let registry = registry();
        let reply = registry.apply(&request(&["incr", "ten"])).await;
        assert_eq!(
            reply,
            RespValue::error("ERR value is not an integer or out of range")
        );
        assert_eq!(registry.handler().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unit_and_status_results() {
        let registry = registry();
        assert_eq!(registry.apply(&request(&["nothing"])).await, RespValue::ok());
        assert_eq!(
            registry.apply(&request(&["status"])).await,
            RespValue::simple_string("QUEUED")
        );
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_reply() {
        let registry = registry();
        assert_eq!(
            registry.apply(&request(&["fail"])).await,
            RespValue::error("ERR error params")
        );
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let registry = registry();
        let err = registry.dispatch(&request(&["FOO"])).await.unwrap_err();
        assert!(matches!(err, CommandError::UnknownCommand(ref name) if name == "FOO"));
        assert_eq!(
            registry.apply(&request(&["FOO"])).await,
            RespValue::error("ERR unknown command 'FOO'")
        );
    }

    #[test]
    fn test_builder_debug_lists_commands() {
        let builder = CommandRegistry::builder(Arc::new(Counter::default()))
            .register("incr", Counter::incr)
            .and_then(|b| b.register("echo", Counter::echo))
            .unwrap();
        assert_eq!(
            format!("{:?}", builder),
            r#"RegistryBuilder { commands: ["echo", "incr"] }"#
        );
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let err = CommandRegistry::builder(Arc::new(Counter::default()))
            .register("incr", Counter::incr)
            .and_then(|b| b.register("INCR", Counter::incr))
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("incr".to_string()));
    }

    #[test]
    fn test_invalid_registrations_rejected() {
        let builder = || CommandRegistry::builder(Arc::new(Counter::default()));

        assert_eq!(
            builder().register("", Counter::nothing).unwrap_err(),
            RegistryError::InvalidName(String::new())
        );
        assert_eq!(
            builder().register("two words", Counter::nothing).unwrap_err(),
            RegistryError::InvalidName("two words".to_string())
        );
        assert_eq!(
            builder().register("bad", Counter::bad_order).unwrap_err(),
            RegistryError::OptionalBeforeRequired("bad".to_string())
        );
    }
}
