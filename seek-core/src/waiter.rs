//! Correlation of asynchronous replies with the operations waiting for them.
//!
//! An operation registers a [`WaitKey`] (expected reply code plus identifying parts such as
//! a username or token), writes its request, then awaits the [`PendingWait`]. Dispatchers
//! call [`Waiter::complete`] as replies arrive. The first of fulfillment, fault, timeout or
//! cancellation resolves the wait, and the entry is removed whichever way it resolves.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::MessageCode;
use crate::{Result, SoulseekError};

type Reply = Result<Box<dyn Any + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaitKey {
    code: MessageCode,
    parts: Vec<String>,
}

impl WaitKey {
    pub fn new(code: impl Into<MessageCode>) -> Self {
        Self {
            code: code.into(),
            parts: Vec::new(),
        }
    }

    pub fn with_part(mut self, part: impl ToString) -> Self {
        self.parts.push(part.to_string());
        self
    }

    pub fn code(&self) -> MessageCode {
        self.code
    }
}

impl fmt::Display for WaitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.code)?;
        for part in &self.parts {
            write!(f, ":{part}")?;
        }
        Ok(())
    }
}

struct Pending {
    id: u64,
    slot: oneshot::Sender<Reply>,
}

pub struct Waiter {
    waits: DashMap<WaitKey, Pending>,
    next_id: AtomicU64,
    default_timeout: Duration,
}

impl Waiter {
    pub fn new(default_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            waits: DashMap::new(),
            next_id: AtomicU64::new(0),
            default_timeout,
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a wait. Fails with `InvalidOperation` if one is already pending for `key`.
    pub fn register<T: Send + 'static>(
        self: &Arc<Self>,
        key: WaitKey,
        timeout: Option<Duration>,
    ) -> Result<PendingWait<T>> {
        let (slot, receiver) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.waits.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(SoulseekError::InvalidOperation(format!(
                    "a wait for {key} is already pending"
                )))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Pending { id, slot });
            }
        }
        Ok(PendingWait {
            waiter: self.clone(),
            key,
            id,
            timeout: timeout.unwrap_or(self.default_timeout),
            receiver,
            _reply: PhantomData,
        })
    }

    /// Register and await in one step.
    pub async fn wait<T: Send + 'static>(
        self: &Arc<Self>,
        key: WaitKey,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<T> {
        self.register(key, timeout)?.wait(cancel).await
    }

    /// Fulfill the wait for `key`. Returns false, doing nothing, if none is pending.
    pub fn complete<T: Send + 'static>(&self, key: &WaitKey, value: T) -> bool {
        self.resolve(key, Ok(Box::new(value)))
    }

    /// Fault the wait for `key` with `error`.
    pub fn throw(&self, key: &WaitKey, error: SoulseekError) -> bool {
        self.resolve(key, Err(error))
    }

    /// Fault every pending wait with `Cancelled`.
    pub fn cancel_all(&self) {
        let keys: Vec<WaitKey> = self.waits.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.throw(&key, SoulseekError::Cancelled(format!("wait for {key} cancelled")));
        }
    }

    pub fn is_pending(&self, key: &WaitKey) -> bool {
        self.waits.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.waits.len()
    }

    fn resolve(&self, key: &WaitKey, reply: Reply) -> bool {
        match self.waits.remove(key) {
            Some((_, pending)) => pending.slot.send(reply).is_ok(),
            None => {
                debug!(%key, "no pending wait");
                false
            }
        }
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("pending", &self.waits.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

/// A registered wait. Dropping it unresolved removes the registration.
#[must_use = "a wait does nothing unless awaited"]
pub struct PendingWait<T> {
    waiter: Arc<Waiter>,
    key: WaitKey,
    id: u64,
    timeout: Duration,
    receiver: oneshot::Receiver<Reply>,
    _reply: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> PendingWait<T> {
    pub fn key(&self) -> &WaitKey {
        &self.key
    }

    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<T> {
        let expired = tokio::select! {
            biased;
            r = &mut self.receiver => Ok(r),
            _ = tokio::time::sleep(self.timeout) => Err(SoulseekError::Timeout(format!(
                "no reply for {} within {}ms",
                self.key,
                self.timeout.as_millis()
            ))),
            _ = cancel.cancelled() => Err(SoulseekError::Cancelled(format!(
                "wait for {} cancelled",
                self.key
            ))),
        };
        let reply = match expired {
            Ok(received) => received.unwrap_or_else(|_| {
                Err(SoulseekError::Cancelled(format!("wait for {} abandoned", self.key)))
            }),
            Err(error) => self.withdraw(error).await,
        };
        reply?.downcast::<T>().map(|b| *b).map_err(|_| {
            SoulseekError::MessageRead(format!("unexpected reply type for {}", self.key))
        })
    }
}

impl<T> PendingWait<T> {
    /// Remove the registration after a timeout or cancellation. If a dispatcher took it
    /// first, its reply is already on the way and wins.
    async fn withdraw(&mut self, error: SoulseekError) -> Reply {
        let id = self.id;
        if self.waiter.waits.remove_if(&self.key, |_, p| p.id == id).is_some() {
            return Err(error);
        }
        (&mut self.receiver).await.unwrap_or(Err(error))
    }
}

impl<T> Drop for PendingWait<T> {
    fn drop(&mut self) {
        let id = self.id;
        self.waiter.waits.remove_if(&self.key, |_, p| p.id == id);
    }
}

impl<T> fmt::Debug for PendingWait<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingWait")
            .field("key", &self.key)
            .field("timeout", &self.timeout)
            .finish()
    }
}
