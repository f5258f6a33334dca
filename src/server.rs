use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::time;

use crate::config::Config;
use crate::error::Result;

mod connection;
mod relay;
mod scheduler;
mod udp;

pub use connection::{ConnectionContext, ConnectionId, ContextState, Event, Step};
pub use scheduler::{Entry, Scheduler};

// pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct SOCKS5Server {
    config: Arc<Config>,
    listener: TcpListener,
    scheduler: Scheduler,
}

impl SOCKS5Server {
    /// Validate `config` and bind the listening socket.
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen_addr()?).await?;
        info!("SOCKS5 server listening on {}", listener.local_addr()?);

        let config = Arc::new(config);
        let scheduler = Scheduler::new(config.clone());
        Ok(SOCKS5Server {
            config,
            listener,
            scheduler,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Accept clients until `shutdown` completes, then close every live
    /// connection and wait for them to drain.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let id = self.scheduler.register(socket, peer);
                        debug!("[{}] accepted connection from {}", id, peer);
                    }
                    Err(err) => {
                        warn!("failed to accept connection: {}", err);
                        time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        info!("shutting down, {} connections active", self.scheduler.active());
        drop(self.listener);
        self.scheduler.shutdown();
        if !self.scheduler.wait_drained(self.config.handshake_timeout()).await {
            warn!("{} connections still open after shutdown", self.scheduler.active());
        }
        Ok(())
    }
}
