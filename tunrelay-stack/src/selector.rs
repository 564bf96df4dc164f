//! Readiness multiplexer over outbound sockets
//!
//! A [`Selector`] is the relay's equivalent of a non-blocking I/O selector:
//! each registered attachment gets a watcher task that waits until the
//! attachment's socket is ready for the current [`Interest`] and then reports
//! a [`SelectedKey`] on a shared channel. Readiness is reported once per arm;
//! the consumer re-arms through [`SelectionKey::set_interest`] after handling
//! the event, which keeps a slow consumer from being flooded with duplicate
//! level-triggered events.
//!
//! ```text
//!  register() ──> watcher task ──(ready)──> SelectorEvents::select()
//!                    ^                               │
//!                    └──── set_interest(Some(..)) ───┘
//! ```

use std::fmt;
use std::future::poll_fn;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Outbound connect completed (successfully or not).
    Connect,
    /// Data, end of stream or an error is waiting to be read.
    Read,
}

/// Anything the selector can wait on.
pub trait Selectable: Send + Sync + 'static {
    fn poll_ready(&self, cx: &mut Context<'_>, interest: Interest) -> Poll<io::Result<()>>;
}

/// Registration handle held by the owner of the attachment.
#[derive(Debug)]
pub struct SelectionKey {
    token: u64,
    interest: watch::Sender<Option<Interest>>,
    cancel: CancellationToken,
}

impl SelectionKey {
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn interest(&self) -> Option<Interest> {
        *self.interest.borrow()
    }

    /// Replace the interest set; `Some` re-arms even when unchanged.
    pub fn set_interest(&self, interest: Option<Interest>) {
        self.interest.send_replace(interest);
    }

    /// Deregister. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One readiness event.
pub struct SelectedKey<A> {
    pub token: u64,
    pub interest: Interest,
    pub result: io::Result<()>,
    pub attachment: Arc<A>,
    cancel: CancellationToken,
}

impl<A> SelectedKey<A> {
    /// False once the registration was cancelled after the event was queued.
    pub fn is_valid(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl<A> fmt::Debug for SelectedKey<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedKey")
            .field("token", &self.token)
            .field("interest", &self.interest)
            .field("result", &self.result)
            .finish()
    }
}

pub struct Selector<A> {
    next_token: AtomicU64,
    events: mpsc::UnboundedSender<SelectedKey<A>>,
    cancel: CancellationToken,
}

/// Receiving side of a [`Selector`], owned by the input worker.
pub struct SelectorEvents<A> {
    rx: mpsc::UnboundedReceiver<SelectedKey<A>>,
}

impl<A: Selectable> Selector<A> {
    pub fn new() -> (Self, SelectorEvents<A>) {
        let (events, rx) = mpsc::unbounded_channel();
        let selector = Self {
            next_token: AtomicU64::new(1),
            events,
            cancel: CancellationToken::new(),
        };
        (selector, SelectorEvents { rx })
    }

    /// Start watching `attachment`. Must be called inside a Tokio runtime.
    pub fn register(&self, attachment: Arc<A>, interest: Option<Interest>) -> SelectionKey {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (interest_tx, interest_rx) = watch::channel(interest);
        let cancel = self.cancel.child_token();

        tokio::spawn(watch_readiness(
            token,
            attachment,
            interest_rx,
            cancel.clone(),
            self.events.clone(),
        ));

        SelectionKey {
            token,
            interest: interest_tx,
            cancel,
        }
    }

    /// Cancel every registration.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<A> Drop for Selector<A> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<A> SelectorEvents<A> {
    /// Wait for at least one ready key and return every key ready so far.
    pub async fn select(&mut self) -> Option<Vec<SelectedKey<A>>> {
        let first = self.rx.recv().await?;
        let mut ready = vec![first];
        while let Ok(next) = self.rx.try_recv() {
            ready.push(next);
        }
        Some(ready)
    }
}

async fn watch_readiness<A: Selectable>(
    token: u64,
    attachment: Arc<A>,
    mut interest: watch::Receiver<Option<Interest>>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SelectedKey<A>>,
) {
    loop {
        let armed = *interest.borrow_and_update();
        let Some(wanted) = armed else {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = interest.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            continue;
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            changed = interest.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
            result = poll_fn(|cx| attachment.poll_ready(cx, wanted)) => result,
        };

        trace!(token, ?wanted, "selector key ready");
        let event = SelectedKey {
            token,
            interest: wanted,
            result,
            attachment: attachment.clone(),
            cancel: cancel.clone(),
        };
        if events.send(event).is_err() {
            return;
        }

        // disarmed until the consumer touches the interest set again
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = interest.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
