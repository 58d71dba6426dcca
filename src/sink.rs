//! Caller-supplied destinations for live [`ResponseEvent`]s.
//!
//! Delivery is synchronous and ordered. A sink runs on the task that is
//! receiving the stream, so it must not block and must not call back into
//! the session that is delivering to it.

use crate::types::ResponseEvent;
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub trait EventSink: Send + Sync {
    fn deliver(&self, event: ResponseEvent);
}

impl<F> EventSink for F
where
    F: Fn(ResponseEvent) + Send + Sync,
{
    fn deliver(&self, event: ResponseEvent) {
        self(event)
    }
}

/// Forwards events into an unbounded channel. Events sent after the
/// receiver is dropped are discarded.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ResponseEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<ResponseEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: ResponseEvent) {
        let _ = self.tx.send(event);
    }
}

/// Serializes each event to JSON before handing it to a string callback.
pub struct JsonSink<F> {
    callback: F,
}

impl<F> JsonSink<F>
where
    F: Fn(String) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> EventSink for JsonSink<F>
where
    F: Fn(String) + Send + Sync,
{
    fn deliver(&self, event: ResponseEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => (self.callback)(json),
            Err(error) => {
                tracing::error!(
                    event = event.kind(),
                    error = %error,
                    "failed to serialize response event; dropping it"
                );
            }
        }
    }
}

/// Keeps every delivered event in memory.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ResponseEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ResponseEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<ResponseEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for RecordingSink {
    fn deliver(&self, event: ResponseEvent) {
        self.events.lock().push(event);
    }
}
