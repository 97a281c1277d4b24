// SPDX-License-Identifier: AGPL-3.0-or-later

//! Unbounded FIFO job queue
//!
//! Producers push into a buffer and never block. A single dispatcher task
//! moves the front item into a capacity-1 channel that every consumer
//! receives from, so exactly one consumer claims each item.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Shared<T> {
    buffer: Mutex<VecDeque<T>>,
    wake: Notify,
}

impl<T> Shared<T> {
    fn pop(&self) -> Option<T> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }
}

/// Producer handle
pub struct JobQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> JobQueue<T> {
    /// Create a queue and spawn its dispatcher, which runs until `shutdown`
    pub fn start(shutdown: CancellationToken) -> (Self, JobReceiver<T>) {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
        });
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(dispatch(Arc::clone(&shared), tx, shutdown));

        (
            Self { shared },
            JobReceiver {
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            },
        )
    }

    /// Append an item; never blocks and never fails
    pub fn enqueue(&self, item: T) {
        self.shared
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(item);
        // a stored permit coalesces repeated wakes
        self.shared.wake.notify_one();
    }

    /// Items buffered but not yet handed to a consumer
    pub fn len(&self) -> usize {
        self.shared
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn dispatch<T>(shared: Arc<Shared<T>>, tx: mpsc::Sender<T>, shutdown: CancellationToken) {
    loop {
        let item = match shared.pop() {
            Some(item) => item,
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = shared.wake.notified() => {}
                }
                continue;
            }
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = tx.send(item) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Queue dispatcher stopped");
}

/// Consumer handle; clones share the same stream of items
pub struct JobReceiver<T> {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for JobReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T> JobReceiver<T> {
    /// Wait for the next item; `None` once the dispatcher has stopped
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}
