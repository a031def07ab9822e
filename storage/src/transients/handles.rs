use super::{table::Inner, Notice, State};
use futures::channel::oneshot;
use shoal_utils::CacheKey;
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// The attached writer of an entry.
///
/// Dropping the writer detaches it (abandoning the entry if it is still being written).
pub struct Writer {
    inner: Arc<Inner>,
    key: CacheKey,
    slot: u32,
    epoch: u32,
}

impl Writer {
    pub(super) fn new(inner: Arc<Inner>, key: CacheKey, slot: u32, epoch: u32) -> Self {
        Self {
            inner,
            key,
            slot,
            epoch,
        }
    }

    /// Key of the entry.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Current state of the entry.
    pub fn state(&self) -> Option<State> {
        self.inner.state_of(self.slot, self.epoch)
    }

    /// Bytes staged so far.
    pub fn staged(&self) -> u64 {
        self.inner.staged_size(self.slot)
    }

    pub(super) fn slot(&self) -> u32 {
        self.slot
    }

    pub(super) fn epoch(&self) -> u32 {
        self.epoch
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.inner.detach_writer(self.slot, self.epoch);
    }
}

/// An attached reader of an entry.
///
/// While any reader is attached the entry (and its staged bytes) stays in place. Dropping the
/// reader detaches it.
pub struct Reader {
    inner: Arc<Inner>,
    key: CacheKey,
    slot: u32,
    epoch: u32,
}

impl Reader {
    pub(super) fn new(inner: Arc<Inner>, key: CacheKey, slot: u32, epoch: u32) -> Self {
        Self {
            inner,
            key,
            slot,
            epoch,
        }
    }

    /// Key of the entry.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Current state of the entry.
    pub fn state(&self) -> Option<State> {
        self.inner.state_of(self.slot, self.epoch)
    }

    /// Bytes staged so far.
    pub fn size(&self) -> u64 {
        self.inner.staged_size(self.slot)
    }

    pub(super) fn slot(&self) -> u32 {
        self.slot
    }

    pub(super) fn epoch(&self) -> u32 {
        self.epoch
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.inner.detach_reader(self.slot, self.epoch);
    }
}

/// Anything attached to an entry.
pub enum Participant {
    Writer(Writer),
    Reader(Reader),
}

impl From<Writer> for Participant {
    fn from(writer: Writer) -> Self {
        Participant::Writer(writer)
    }
}

impl From<Reader> for Participant {
    fn from(reader: Reader) -> Self {
        Participant::Reader(reader)
    }
}

/// A pending wait for an entry being written.
///
/// Resolves once, when the writer completes or abandons the entry, to the attached [Reader] and
/// the [Notice] describing the outcome. Dropping the subscription detaches its reader.
pub struct Subscription {
    reader: Option<Reader>,
    receiver: oneshot::Receiver<Notice>,
}

impl Subscription {
    pub(super) fn new(reader: Reader, receiver: oneshot::Receiver<Notice>) -> Self {
        Self {
            reader: Some(reader),
            receiver,
        }
    }

    /// Key of the entry waited on.
    pub fn key(&self) -> Option<&CacheKey> {
        self.reader.as_ref().map(Reader::key)
    }
}

impl Future for Subscription {
    type Output = (Reader, Notice);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let notice = match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(notice)) => notice,
            // The table dropped the waiter without deciding (the slot was reused)
            Poll::Ready(Err(oneshot::Canceled)) => Notice::Abandoned,
            Poll::Pending => return Poll::Pending,
        };
        let reader = self
            .reader
            .take()
            .expect("subscription polled after completion");
        Poll::Ready((reader, notice))
    }
}
