//! Drives every live [`ConnectionContext`] and keeps a registry of them.
//!
//! Each context is owned by exactly one runtime task. The task parks on the
//! context's readiness future, runs one step when it fires, and goes back to
//! waiting, so a stalled client only ever holds its own task. The registry
//! is bookkeeping: it never touches a socket and its lock is never held
//! across an await.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::time;

use super::connection::{ConnectionContext, ConnectionId, ContextState, Event, Step};
use crate::config::Config;

/// Registry entry for one live connection.
#[derive(Clone, Debug)]
pub struct Entry {
    pub peer: SocketAddr,
    pub state: ContextState,
    pub created_at: Instant,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<Config>,
    registry: Mutex<HashMap<ConnectionId, Entry>>,
    next_id: AtomicU64,
    stop: watch::Sender<bool>,
    drained: Notify,
}

enum Wake {
    Ready(Event),
    Expired,
    Stopped,
}

impl Scheduler {
    pub fn new(config: Arc<Config>) -> Self {
        let (stop, _) = watch::channel(false);
        Scheduler {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                stop,
                drained: Notify::new(),
            }),
        }
    }

    /// Take ownership of an accepted client and start driving it.
    pub fn register(&self, client: TcpStream, peer: SocketAddr) -> ConnectionId {
        let id = ConnectionId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let context = ConnectionContext::new(id, client, peer, &self.inner.config);

        self.inner.registry.lock().insert(
            id,
            Entry {
                peer,
                state: context.state(),
                created_at: context.created_at(),
            },
        );

        let registration = Registration {
            scheduler: self.clone(),
            id,
        };
        tokio::spawn(async move {
            registration.scheduler.drive(context).await;
            drop(registration);
        });

        id
    }

    /// Number of connections currently registered.
    pub fn active(&self) -> usize {
        self.inner.registry.lock().len()
    }

    pub fn snapshot(&self) -> Vec<(ConnectionId, Entry)> {
        let registry = self.inner.registry.lock();
        let mut entries: Vec<_> = registry.iter().map(|(id, entry)| (*id, entry.clone())).collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    /// Ask every connection to close at its next wake-up.
    pub fn shutdown(&self) {
        self.inner.stop.send_replace(true);
    }

    /// Wait until the registry is empty. Returns `false` on timeout.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.inner.drained.notified();
                if self.active() == 0 {
                    return;
                }
                notified.await;
            }
        };
        time::timeout(timeout, drained).await.is_ok()
    }

    async fn drive(&self, mut context: ConnectionContext) {
        let id = context.id();
        let deadline = time::Instant::from_std(context.created_at()) + self.inner.config.handshake_timeout();
        let mut stop = self.inner.stop.subscribe();

        loop {
            let negotiating = context.state().is_negotiating();
            let wake = tokio::select! {
                event = context.ready() => Wake::Ready(event),
                _ = time::sleep_until(deadline), if negotiating => Wake::Expired,
                _ = stop.wait_for(|stopped| *stopped) => Wake::Stopped,
            };

            match wake {
                Wake::Ready(event) => match context.step(event) {
                    Step::Continue => self.update(id, context.state()),
                    Step::Close => break,
                },
                Wake::Expired => {
                    info!(
                        "[{}] evicting {} still in {:?} after {:?}",
                        id,
                        context.peer(),
                        context.state(),
                        self.inner.config.handshake_timeout()
                    );
                    context.evict();
                    break;
                }
                Wake::Stopped => {
                    debug!("[{}] closing for shutdown", id);
                    context.close();
                    break;
                }
            }
        }

        debug!("[{}] connection from {} closed", id, context.peer());
    }

    fn update(&self, id: ConnectionId, state: ContextState) {
        if let Some(entry) = self.inner.registry.lock().get_mut(&id) {
            entry.state = state;
        }
    }

    fn reap(&self, id: ConnectionId) {
        let mut registry = self.inner.registry.lock();
        registry.remove(&id);
        if registry.is_empty() {
            self.inner.drained.notify_waiters();
        }
    }
}

// Removes the registry entry when the driving task ends, even by panic.
struct Registration {
    scheduler: Scheduler,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.scheduler.reap(self.id);
    }
}
