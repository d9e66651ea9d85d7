//! Connection pool
//!
//! Owns the reactor shared by a set of connections: a multi-threaded tokio
//! runtime with one worker per connection plus one spare, and the connections
//! bound to it. Pools are plain owned values; nothing here is process-wide.

use std::future::Future;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};

use super::connection::Connection;
use super::NetworkConfig;

/// Pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to start reactor: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Pool not running")]
    NotRunning,
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Owns a reactor, its worker threads and the connections running on it
pub struct ConnectionPool {
    config: NetworkConfig,
    label: String,
    worker_count: usize,
    /// Holding the runtime keeps the reactor alive; taking it out is the first step of `stop`
    runtime: Option<Runtime>,
    connections: Vec<Connection>,
}

impl ConnectionPool {
    /// Create a stopped pool
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            label: String::new(),
            worker_count: 0,
            runtime: None,
            connections: Vec::new(),
        }
    }

    /// Start the reactor with `connection_count + 1` workers and create the connections.
    ///
    /// A running pool is fully stopped first.
    pub fn init(&mut self, label: impl Into<String>, connection_count: usize) -> PoolResult<()> {
        if self.is_running() {
            self.stop();
        }

        let label = label.into();
        let worker_count = connection_count + 1;
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_count)
            .thread_name(format!("{}-worker", label))
            .enable_all()
            .build()?;

        let handle = runtime.handle().clone();
        self.connections = (0..connection_count)
            .map(|index| {
                Connection::new(
                    format!("{}#{}", label, index),
                    handle.clone(),
                    self.config.clone(),
                )
            })
            .collect();

        tracing::info!(
            "{} : Started {} worker threads for {} connections",
            label,
            worker_count,
            connection_count
        );

        self.label = label;
        self.worker_count = worker_count;
        self.runtime = Some(runtime);
        Ok(())
    }

    /// Close every connection, let queued writes drain, then join the workers.
    ///
    /// Does nothing if the pool is not running.
    pub fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        let writers: Vec<_> = self
            .connections
            .iter()
            .filter_map(|connection| {
                connection.close();
                connection.take_writer()
            })
            .collect();

        let drain_timeout = self.config.drain_timeout();
        if Handle::try_current().is_ok() {
            // Blocking is not allowed here, so skip the drain and detach the workers
            tracing::debug!("{} : Stopped from an async context, not draining", self.label);
            self.connections.clear();
            runtime.shutdown_background();
        } else {
            runtime.block_on(async {
                let drained = async {
                    for writer in writers {
                        let _ = writer.await;
                    }
                };
                if tokio::time::timeout(drain_timeout, drained).await.is_err() {
                    tracing::warn!("{} : Pending writes did not drain in time", self.label);
                }
            });
            self.connections.clear();
            runtime.shutdown_timeout(drain_timeout);
        }

        tracing::info!("{} : Stopped", self.label);
        self.worker_count = 0;
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Number of reactor worker threads, zero when stopped
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn connection(&self, index: usize) -> Option<&Connection> {
        self.connections.get(index)
    }

    /// Handle to the reactor, for spawning extra work onto it
    pub fn handle(&self) -> Option<Handle> {
        self.runtime.as_ref().map(|runtime| runtime.handle().clone())
    }

    /// Drive `future` to completion on the pool's reactor from a synchronous caller.
    ///
    /// Must not be called from within an async context.
    pub fn block_on<F: Future>(&self, future: F) -> PoolResult<F::Output> {
        let runtime = self.runtime.as_ref().ok_or(PoolError::NotRunning)?;
        Ok(runtime.block_on(future))
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.stop();
    }
}
