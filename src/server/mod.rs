//! Wire Protocol Server
//!
//! Accepts clients on a TCP or Unix socket and serves each one on its own
//! task through a shared [`CommandRegistry`].
//!
//! ## Shutdown
//!
//! When the shutdown future passed to [`Server::serve`] resolves:
//!
//! 1. the listener is closed (a Unix socket file is removed),
//! 2. idle connections are told to close; busy ones finish their batch,
//! 3. after the grace period the remaining connections are aborted,
//! 4. the handler's [`Lifecycle::shutdown`] runs.

pub mod connection;
pub mod listener;

pub use connection::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
pub use listener::{ListenAddr, Listener, Stream};

use crate::commands::CommandRegistry;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Default time connections get to finish after shutdown starts
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Start/stop hooks of the component behind a registry.
pub trait Lifecycle: Send + Sync + 'static {
    /// Called once, after every connection has ended.
    fn shutdown(&self) -> impl Future<Output = ()> + Send;
}

/// Startup failures. Once serving, problems are logged and never surface.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: ListenAddr,
        #[source]
        source: io::Error,
    },
}

/// A bound server, ready to [`serve`](Server::serve).
pub struct Server<H> {
    listener: Listener,
    registry: Arc<CommandRegistry<H>>,
    stats: Arc<ConnectionStats>,
    grace_period: Duration,
}

impl<H: Lifecycle> Server<H> {
    pub async fn bind(addr: &ListenAddr, registry: CommandRegistry<H>) -> Result<Self, ServerError> {
        let listener = Listener::bind(addr).await.map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;

        Ok(Self {
            listener,
            registry: Arc::new(registry),
            stats: Arc::new(ConnectionStats::new()),
            grace_period: DEFAULT_GRACE_PERIOD,
        })
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn local_addr(&self) -> io::Result<ListenAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Accepts clients until `shutdown` resolves, then stops gracefully.
    /// The handler's [`Lifecycle::shutdown`] always runs before this returns.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) {
        let Server {
            listener,
            registry,
            stats,
            grace_period,
        } = self;

        match listener.local_addr() {
            Ok(addr) => info!(addr = %addr, "accepting connections"),
            Err(e) => warn!(error = %e, "accepting connections on an unknown address"),
        }

        let (close_tx, _) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "accepted connection");
                        connections.spawn(handle_connection(
                            stream,
                            peer,
                            Arc::clone(&registry),
                            Arc::clone(&stats),
                            close_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        // Usually fd exhaustion; give connections time to close.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "connection task panicked");
                        }
                    }
                }
            }
        }

        drop(listener);
        info!(
            connections = connections.len(),
            grace_secs = grace_period.as_secs_f64(),
            "stopped accepting, closing connections"
        );

        close_tx.send_replace(true);
        let drained = tokio::time::timeout(grace_period, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(remaining = connections.len(), "grace period expired, aborting connections");
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        registry.handler().shutdown().await;
        info!("server stopped");
    }
}
