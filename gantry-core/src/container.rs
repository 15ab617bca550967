//! Lifecycle manager for named long-running workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{GantryError, Result};

/// A long-running worker managed by a [`ServiceContainer`].
///
/// `on_start` receives the worker's cancellation scope; `serve` is expected
/// to run until that scope is cancelled.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn on_start(&self, shutdown: CancellationToken) -> Result<()>;
    async fn serve(&self) -> Result<()>;
    async fn on_stop(&self);
}

const STATUS_STARTED: u8 = 1;
const STATUS_STOPPED: u8 = 2;

struct ServiceEntry {
    name: String,
    status: Arc<AtomicU8>,
    token: CancellationToken,
}

/// Runs registered services, each in its own task under a shared scope.
pub struct ServiceContainer {
    token: CancellationToken,
    services: Mutex<HashMap<usize, ServiceEntry>>,
    handles: Mutex<Vec<JoinHandle<Result<()>>>>,
    first_error: Arc<Mutex<Option<GantryError>>>,
}

impl ServiceContainer {
    #[must_use]
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            services: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
            first_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Register and start a service. Fails if this exact instance is already
    /// registered.
    pub async fn start_service(&self, name: &str, service: Arc<dyn Service>) -> Result<()> {
        let key = Arc::as_ptr(&service) as *const () as usize;
        let token = self.token.child_token();
        let status = Arc::new(AtomicU8::new(0));
        {
            let mut services = lock_poisoned(&self.services);
            if services.contains_key(&key) {
                return Err(GantryError::ServiceAlreadyStarted(name.to_string()));
            }
            services.insert(
                key,
                ServiceEntry {
                    name: name.to_string(),
                    status: status.clone(),
                    token: token.clone(),
                },
            );
        }
        debug!(target: "gantry::service", name, "start service");
        if let Err(err) = service.on_start(token.clone()).await {
            lock_poisoned(&self.services).remove(&key);
            return Err(err);
        }
        status.store(STATUS_STARTED, Ordering::SeqCst);

        let first_error = self.first_error.clone();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            let result = service.serve().await;
            service.on_stop().await;
            if let Err(err) = &result {
                warn!(target: "gantry::service", name = %task_name, error = %err, "service exited with error");
                let mut slot = lock_poisoned(&first_error);
                if slot.is_none() {
                    *slot = Some(GantryError::Internal(format!("{task_name}: {err}")));
                }
            }
            result
        });
        lock_poisoned(&self.handles).push(handle);
        Ok(())
    }

    /// Cancel one service's scope. Idempotent: a second stop of the same
    /// instance reports `ServiceAlreadyStopped`.
    pub fn stop_service(&self, service: &Arc<dyn Service>) -> Result<()> {
        let key = Arc::as_ptr(service) as *const () as usize;
        let services = lock_poisoned(&self.services);
        let entry = services.get(&key).ok_or(GantryError::ServiceNotFound)?;
        if entry
            .status
            .compare_exchange(STATUS_STARTED, STATUS_STOPPED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(GantryError::ServiceAlreadyStopped(entry.name.clone()));
        }
        debug!(target: "gantry::service", name = %entry.name, "stop service");
        entry.token.cancel();
        Ok(())
    }

    /// Block until the container scope is cancelled, then wait for every
    /// service to return. The first failure wins.
    pub async fn serve(&self) -> Result<()> {
        self.token.cancelled().await;
        self.join_all().await
    }

    /// Cancel every service and wait for all of them to return.
    pub async fn stop(&self) -> Result<()> {
        {
            let services = lock_poisoned(&self.services);
            for entry in services.values() {
                entry.status.store(STATUS_STOPPED, Ordering::SeqCst);
                entry.token.cancel();
            }
        }
        self.token.cancel();
        self.join_all().await
    }

    async fn join_all(&self) -> Result<()> {
        let handles: Vec<_> = lock_poisoned(&self.handles).drain(..).collect();
        for handle in handles {
            match handle.await {
                Ok(_) => {}
                Err(err) if err.is_panic() => {
                    warn!(target: "gantry::service", error = %err, "service task panicked");
                    let mut slot = lock_poisoned(&self.first_error);
                    if slot.is_none() {
                        *slot = Some(GantryError::Internal(format!("service panicked: {err}")));
                    }
                }
                Err(_) => {}
            }
        }
        match lock_poisoned(&self.first_error).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn lock_poisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Mutex as AsyncMutex;

    struct Ticker {
        started: AtomicBool,
        stopped: AtomicBool,
        token: AsyncMutex<Option<CancellationToken>>,
    }

    impl Ticker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                token: AsyncMutex::new(None),
            })
        }
    }

    #[async_trait]
    impl Service for Ticker {
        async fn on_start(&self, shutdown: CancellationToken) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            *self.token.lock().await = Some(shutdown);
            Ok(())
        }

        async fn serve(&self) -> Result<()> {
            let token = self.token.lock().await.clone();
            if let Some(token) = token {
                token.cancelled().await;
            }
            Ok(())
        }

        async fn on_stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let root = CancellationToken::new();
        let container = ServiceContainer::new(&root);
        let ticker = Ticker::new();
        let svc: Arc<dyn Service> = ticker.clone();

        container.start_service("ticker", svc.clone()).await.unwrap();
        assert!(ticker.started.load(Ordering::SeqCst));

        container.stop_service(&svc).unwrap();
        container.stop().await.unwrap();
        assert!(ticker.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn double_start_same_instance_fails() {
        let root = CancellationToken::new();
        let container = ServiceContainer::new(&root);
        let svc: Arc<dyn Service> = Ticker::new();

        container.start_service("a", svc.clone()).await.unwrap();
        let err = container.start_service("a", svc.clone()).await.unwrap_err();
        assert!(matches!(err, GantryError::ServiceAlreadyStarted(_)));
        container.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_service_is_cas_guarded() {
        let root = CancellationToken::new();
        let container = ServiceContainer::new(&root);
        let svc: Arc<dyn Service> = Ticker::new();

        container.start_service("a", svc.clone()).await.unwrap();
        container.stop_service(&svc).unwrap();
        let err = container.stop_service(&svc).unwrap_err();
        assert!(matches!(err, GantryError::ServiceAlreadyStopped(_)));
        container.stop().await.unwrap();
    }

    #[tokio::test]
    async fn serve_error_propagates() {
        struct Failing;

        #[async_trait]
        impl Service for Failing {
            async fn on_start(&self, _shutdown: CancellationToken) -> Result<()> {
                Ok(())
            }
            async fn serve(&self) -> Result<()> {
                Err(GantryError::Internal("boom".into()))
            }
            async fn on_stop(&self) {}
        }

        let root = CancellationToken::new();
        let container = ServiceContainer::new(&root);
        container
            .start_service("failing", Arc::new(Failing))
            .await
            .unwrap();
        let err = container.stop().await.unwrap_err();
        assert!(matches!(err, GantryError::Internal(_)));
    }
}
