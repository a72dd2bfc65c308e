//! Pending-call table.
//!
//! Maps request identifiers to one-shot result slots. The dispatcher inserts
//! slots, the receive path resolves them, and each waiter only ever observes
//! its own slot.

use crate::error::ClientError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use wiremux_protocol::Response;

/// Concurrent identifier → slot map shared by the dispatcher and the decode path.
#[derive(Clone, Default)]
pub struct PendingCallTable {
    slots: Arc<DashMap<String, oneshot::Sender<Response>>>,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fresh slot for `id`.
    pub fn register(&self, id: impl Into<String>) -> Result<PendingCall, ClientError> {
        let id = id.into();
        match self.slots.entry(id.clone()) {
            Entry::Occupied(_) => Err(ClientError::DuplicateRequestId(id)),
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(tx);
                Ok(PendingCall {
                    id,
                    rx,
                    table: self.clone(),
                })
            }
        }
    }

    /// Resolves the slot named by the response's identifier.
    ///
    /// Returns `false` when no slot is waiting for it.
    pub fn resolve(&self, response: Response) -> bool {
        match self.slots.remove(&response.uuid) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Returns whether a slot is registered for `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    /// Fails every outstanding slot with a connection-closed error.
    pub fn clear(&self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Removes the slot for `id` only if its waiter has gone away.
    fn release(&self, id: &str) {
        self.slots.remove_if(id, |_, tx| tx.is_closed());
    }
}

/// An outstanding call. Resolves to the correlated response.
///
/// Dropping the call (or calling [`PendingCall::cancel`]) releases its slot; a
/// response arriving afterwards is treated as unmatched.
pub struct PendingCall {
    id: String,
    rx: oneshot::Receiver<Response>,
    table: PendingCallTable,
}

impl PendingCall {
    /// Identifier this call is waiting on.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stops waiting. Nothing is sent to the peer.
    pub fn cancel(self) {
        drop(self);
    }

    /// Waits for the response and decodes its body into `T`.
    ///
    /// A non-2xx status or an undecodable body fails only this call.
    pub async fn typed<T: DeserializeOwned>(self) -> Result<T, ClientError> {
        let response = self.await?;
        decode_body(response)
    }
}

impl Future for PendingCall {
    type Output = Result<Response, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| ClientError::ConnectionClosed))
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.rx.close();
        self.table.release(&self.id);
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall").field("id", &self.id).finish()
    }
}

/// Decodes a response body into `T`.
///
/// Bodies that were sent as JSON text inside a string are parsed as well.
pub fn decode_body<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    if !response.is_success() {
        return Err(ClientError::CallFailed {
            status: response.status_code,
            reason: response.reason_phrase,
        });
    }
    let body = response.message_body.unwrap_or(serde_json::Value::Null);
    match serde_json::from_value::<T>(body.clone()) {
        Ok(value) => Ok(value),
        Err(err) => match body.as_str() {
            Some(text) => serde_json::from_str(text).map_err(ClientError::from),
            None => Err(err.into()),
        },
    }
}
