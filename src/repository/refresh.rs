//! Background index refresh.
//!
//! Requests go through a bounded queue; when the queue is full the request
//! is coalesced into the ones already waiting, so a burst of refresh calls
//! costs at most a queue's worth of rebuilds.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Weak;
use std::thread;

use tracing::{debug, error};

use super::index::SessionScope;
use super::RepoInner;

const REFRESH_QUEUE_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy)]
pub(crate) struct RefreshRequest {
    pub(crate) scope: SessionScope,
}

#[derive(Debug)]
pub(crate) struct RefreshWorker {
    sender: Option<SyncSender<RefreshRequest>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RefreshWorker {
    pub(crate) fn spawn(inner: Weak<RepoInner>) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(REFRESH_QUEUE_DEPTH);
        let handle = thread::Builder::new()
            .name("lantern-repo-refresh".into())
            .spawn(move || Self::run(inner, receiver))?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Enqueues a refresh; a full queue coalesces the request.
    pub(crate) fn request(&self, request: RefreshRequest) {
        if let Some(sender) = &self.sender {
            match sender.try_send(request) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!("repo.refresh.request_coalesced");
                }
                Err(TrySendError::Disconnected(_)) => {
                    error!("repo.refresh.worker_gone");
                }
            }
        }
    }

    fn run(inner: Weak<RepoInner>, receiver: Receiver<RefreshRequest>) {
        while let Ok(request) = receiver.recv() {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.rebuild(request.scope);
            drop(inner);
        }
        debug!("repo.refresh.worker_stopped");
    }

    pub(crate) fn shutdown(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RefreshWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
