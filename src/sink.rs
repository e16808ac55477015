//! Background persistence of relay-sourced events.
//!
//! Query paths hand their seed events to the sink and move on; a single
//! worker task writes them to the store so disk latency never sits on a
//! response. Write errors are logged and swallowed, the store catches up on
//! the next batch.

use tokio::sync::{mpsc, oneshot};

use crate::event::Event;
use crate::store::Store;

enum SinkMsg {
    Batch(Vec<Event>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the persistence worker. Cheap to clone.
#[derive(Clone)]
pub struct Sink {
    tx: mpsc::UnboundedSender<SinkMsg>,
}

impl Sink {
    /// Spawn the worker task writing into `store`.
    pub fn spawn(store: Store) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    SinkMsg::Batch(events) => {
                        if let Err(e) = store.put(&events) {
                            eprintln!("[sink] persist error: {e}");
                        }
                    }
                    SinkMsg::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    /// Queue a batch for persistence without waiting on disk.
    pub fn persist(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let _ = self.tx.send(SinkMsg::Batch(events));
    }

    /// Wait until every batch queued before this call has been written.
    /// Used by one-shot commands before exiting.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(SinkMsg::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}
