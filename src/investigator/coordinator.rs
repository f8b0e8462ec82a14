//! Request/response coordinator

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::{ProvisionRequest, WorkerMessage};
use super::worker::ProvisionWorker;
use super::{InvestigatorError, ProvisionError};
use crate::model::{Cluster, Host};
use crate::store::StoreManager;

/// Called once with the provisioned host and the error that stopped the
/// pass, if any
pub type CompletionCallback =
    Box<dyn FnOnce(Host, Option<ProvisionError>) -> BoxFuture<'static, ()> + Send>;

type PendingMap = Arc<Mutex<HashMap<String, Option<CompletionCallback>>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, Option<CompletionCallback>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Front half of the investigator, owned by the API layer
pub struct Investigator {
    requests: UnboundedSender<ProvisionRequest>,
    responses: UnboundedSender<WorkerMessage>,
    pending: PendingMap,
    worker: JoinHandle<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Investigator {
    /// Start `worker` and the response listener
    pub fn spawn(worker: ProvisionWorker) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let worker_responses = response_tx.clone();
        let handle = tokio::spawn(async move {
            worker.run(request_rx, worker_responses).await;
        });
        Self::from_parts(request_tx, response_tx, response_rx, handle)
    }

    /// Assemble a coordinator around existing channels and a running worker
    /// task. Spawns the response listener.
    pub fn from_parts(
        requests: UnboundedSender<ProvisionRequest>,
        responses: UnboundedSender<WorkerMessage>,
        response_rx: UnboundedReceiver<WorkerMessage>,
        worker: JoinHandle<()>,
    ) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let listener = tokio::spawn(listen(response_rx, pending.clone()));
        Self {
            requests,
            responses,
            pending,
            worker,
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Queue `host` for provisioning.
    ///
    /// `callback` replaces any callback already registered for the address;
    /// the earlier request keeps running and whichever response arrives
    /// first consumes the slot.
    pub fn submit(
        &self,
        store: &StoreManager,
        host: Host,
        cluster: Option<Cluster>,
        callback: Option<CompletionCallback>,
    ) -> Result<Uuid, InvestigatorError> {
        let id = Uuid::new_v4();
        let address = host.address.clone();

        if lock(&self.pending).insert(address.clone(), callback).is_some() {
            debug!("Replacing pending callback for {}", address);
        }

        let request = ProvisionRequest {
            id,
            store: store.clone(),
            host,
            cluster,
        };
        if self.requests.send(request).is_err() {
            lock(&self.pending).remove(&address);
            return Err(InvestigatorError::WorkerGone);
        }
        info!("Submitted {} for investigation (request {})", address, id);
        Ok(id)
    }

    pub fn is_pending(&self, address: &str) -> bool {
        lock(&self.pending).contains_key(address)
    }

    /// Forget the callback for `address`. A response that still arrives is
    /// logged and dropped.
    pub fn cancel_pending(&self, address: &str) -> bool {
        lock(&self.pending).remove(address).is_some()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Whether the worker task is still running
    pub fn is_alive(&self) -> bool {
        !self.worker.is_finished()
    }

    /// Stop the listener with the shutdown sentinel and terminate the worker.
    pub async fn stop(&self) {
        if self.responses.send(WorkerMessage::Shutdown).is_err() {
            debug!("Response listener already gone");
        }
        self.worker.abort();
        while !self.worker.is_finished() {
            tokio::task::yield_now().await;
        }

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = listener {
            if let Err(e) = handle.await {
                warn!("Response listener ended abnormally: {}", e);
            }
        }
        info!("Investigator stopped");
    }
}

/// Drain the response channel until the shutdown sentinel arrives
async fn listen(mut responses: UnboundedReceiver<WorkerMessage>, pending: PendingMap) {
    debug!("Response listener started");
    while let Some(message) = responses.recv().await {
        let response = match message {
            WorkerMessage::Shutdown => break,
            WorkerMessage::Response(response) => response,
        };

        let address = response.host.address.clone();
        let entry = lock(&pending).remove(&address);
        match entry {
            None => warn!(
                "No pending request for {} (response {}), dropping it",
                address, response.id
            ),
            Some(None) => debug!("Request {} for {} had no callback", response.id, address),
            Some(Some(callback)) => {
                debug!("Invoking callback for {} (response {})", address, response.id);
                callback(response.host, response.error).await;
            }
        }
    }
    debug!("Response listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::investigator::messages::ProvisionResponse;
    use crate::model::HostStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    struct Harness {
        investigator: Investigator,
        requests: UnboundedReceiver<ProvisionRequest>,
        responses: UnboundedSender<WorkerMessage>,
    }

    fn harness() -> Harness {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(std::future::pending::<()>());
        let investigator =
            Investigator::from_parts(request_tx, response_tx.clone(), response_rx, worker);
        Harness {
            investigator,
            requests: request_rx,
            responses: response_tx,
        }
    }

    fn respond(tx: &UnboundedSender<WorkerMessage>, host: Host, error: Option<ProvisionError>) {
        tx.send(WorkerMessage::Response(ProvisionResponse {
            id: Uuid::new_v4(),
            host,
            error,
        }))
        .unwrap();
    }

    #[tokio::test]
    async fn test_callback_invoked_once_with_response() {
        let mut h = harness();
        let store = StoreManager::in_memory();
        let (tx, rx) = oneshot::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let callback: CompletionCallback = Box::new(move |host, error| {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send((host, error));
            })
        });
        h.investigator
            .submit(&store, Host::new("10.2.0.2"), None, Some(callback))
            .unwrap();
        assert!(h.investigator.is_pending("10.2.0.2"));

        let request = h.requests.recv().await.unwrap();
        assert_eq!(request.host.address, "10.2.0.2");
        assert!(request.cluster.is_none());

        let error = ProvisionError::Bootstrap {
            address: "10.2.0.2".to_string(),
            reason: "exit code 2".to_string(),
        };
        respond(
            &h.responses,
            Host::new("10.2.0.2").with_status(HostStatus::Disassociated),
            Some(error.clone()),
        );

        let (host, received) = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(host.status, HostStatus::Disassociated);
        assert_eq!(received, Some(error));

        // a duplicate response finds no pending entry
        respond(&h.responses, Host::new("10.2.0.2"), None);
        h.investigator.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!h.investigator.is_pending("10.2.0.2"));
    }

    #[tokio::test]
    async fn test_unmatched_response_is_dropped() {
        let h = harness();
        respond(&h.responses, Host::new("10.9.9.9"), None);
        h.investigator.stop().await;
        assert_eq!(h.investigator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fire_and_forget_submit() {
        let mut h = harness();
        let store = StoreManager::in_memory();
        h.investigator
            .submit(&store, Host::new("a"), None, None)
            .unwrap();
        assert!(h.investigator.is_pending("a"));
        assert!(h.requests.recv().await.is_some());

        respond(&h.responses, Host::new("a"), None);
        h.investigator.stop().await;
        assert!(!h.investigator.is_pending("a"));
    }

    #[tokio::test]
    async fn test_last_submit_wins() {
        let h = harness();
        let store = StoreManager::in_memory();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second"] {
            let fired = fired.clone();
            let callback: CompletionCallback = Box::new(move |_, _| {
                Box::pin(async move {
                    fired.lock().unwrap().push(label);
                })
            });
            h.investigator
                .submit(&store, Host::new("a"), None, Some(callback))
                .unwrap();
        }
        assert_eq!(h.investigator.pending_count(), 1);

        respond(&h.responses, Host::new("a"), None);
        respond(&h.responses, Host::new("a"), None);
        h.investigator.stop().await;
        assert_eq!(*fired.lock().unwrap(), vec!["second"]);
    }

    #[tokio::test]
    async fn test_cancel_pending() {
        let h = harness();
        let store = StoreManager::in_memory();
        h.investigator
            .submit(&store, Host::new("a"), None, None)
            .unwrap();
        assert!(h.investigator.cancel_pending("a"));
        assert!(!h.investigator.cancel_pending("a"));
        assert!(!h.investigator.is_pending("a"));
    }

    #[tokio::test]
    async fn test_liveness_and_dead_worker() {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(async move {
            drop(request_rx);
        });
        let investigator = Investigator::from_parts(request_tx, response_tx, response_rx, worker);

        tokio::time::timeout(Duration::from_secs(5), async {
            while investigator.is_alive() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let store = StoreManager::in_memory();
        let err = investigator
            .submit(&store, Host::new("a"), None, None)
            .unwrap_err();
        assert!(matches!(err, InvestigatorError::WorkerGone));
        assert!(!investigator.is_pending("a"));
        investigator.stop().await;
    }
}
