//! Correlation of outgoing requests with runner replies.

use crate::error::{ProtocolError, ReplyError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::time::Duration;

/// Table of outstanding requests: request id -> completion handle.
///
/// An entry is inserted once, when the request is dispatched, and removed once, when its reply
/// arrives. Entries of requests that never get a reply stay in the table for the whole
/// connector lifetime.
#[derive(Default)]
pub struct PendingRequests {
    completions: HashMap<u64, SyncSender<Value>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request, return a handle completed by [`PendingRequests::resolve`].
    ///
    /// # Panics
    ///
    /// Panics if `id` is already registered, ids must never be reused.
    pub fn insert(&mut self, id: u64) -> PendingReply {
        let (tx, rx) = mpsc::sync_channel(1);
        let prev = self.completions.insert(id, tx);
        assert!(prev.is_none(), "request id {id} reused");
        PendingReply { id, receiver: rx }
    }

    /// Complete and remove a request.
    pub fn resolve(&mut self, id: u64, payload: Value) -> Result<(), ProtocolError> {
        let completion = self
            .completions
            .remove(&id)
            .ok_or(ProtocolError::UnknownReply(id))?;
        // a handle dropped by its owner is not an error, nobody waits for this reply
        _ = completion.try_send(payload);
        Ok(())
    }

    pub fn contains(&self, id: u64) -> bool {
        self.completions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.completions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completions.is_empty()
    }
}

/// Completion handle of a single request, resolves with the raw reply payload.
pub struct PendingReply {
    id: u64,
    receiver: Receiver<Value>,
}

impl Debug for PendingReply {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply").field("id", &self.id).finish()
    }
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the reply arrives.
    ///
    /// Return [`ReplyError::SessionGone`] if the connector was dropped before reply.
    pub fn wait(self) -> Result<Value, ReplyError> {
        self.receiver.recv().map_err(|_| ReplyError::SessionGone)
    }

    /// Block until the reply arrives or timeout expires.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Value, ReplyError> {
        self.receiver.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ReplyError::Timeout,
            RecvTimeoutError::Disconnected => ReplyError::SessionGone,
        })
    }

    /// Return a reply if it has already arrived.
    pub fn try_take(&self) -> Result<Option<Value>, ReplyError> {
        match self.receiver.try_recv() {
            Ok(v) => Ok(Some(v)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ReplyError::SessionGone),
        }
    }
}

type Decoder<T> = Box<dyn FnOnce(Value) -> Result<T, ReplyError> + Send>;

/// Typed completion handle, decodes the reply payload into `T`.
pub struct Pending<T> {
    reply: PendingReply,
    decoder: Decoder<T>,
}

impl<T: DeserializeOwned + 'static> Pending<T> {
    /// Deserialize reply payload as `T`.
    pub fn deserialize(reply: PendingReply) -> Self {
        Self::map(reply, |payload| Ok(serde_json::from_value(payload)?))
    }
}

impl<T> Pending<T> {
    pub fn map(
        reply: PendingReply,
        decoder: impl FnOnce(Value) -> Result<T, ReplyError> + Send + 'static,
    ) -> Self {
        Self {
            reply,
            decoder: Box::new(decoder),
        }
    }

    pub fn id(&self) -> u64 {
        self.reply.id()
    }

    pub fn wait(self) -> Result<T, ReplyError> {
        let payload = self.reply.wait()?;
        (self.decoder)(payload)
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<T, ReplyError> {
        let payload = self.reply.wait_timeout(timeout)?;
        (self.decoder)(payload)
    }
}
