//! Discovery coordinator, driving the advertise and browse lifecycles.
//!
//! Advertising and discovering are independent toggles. A discovery round
//! runs in a background task that forwards sightings into the
//! [`ServiceRegistry`]; the round ends when the backend's stream completes,
//! when the discovery timeout elapses, or when [`DiscoveryCoordinator::stop_discovering`]
//! is called. Forwarding happens under the same lock `stop_discovering`
//! takes, so nothing is forwarded once it returns.

use crate::backend::{AdvertisementHandle, DiscoveryBackend};
use crate::event::DiscoveryEvent;
use crate::registry::ServiceRegistry;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wroup_types::config::WroupConfig;
use wroup_types::{Attributes, WroupError};

#[derive(Debug, Default)]
struct RoundState {
    generation: u64,
    active: bool,
    task: Option<JoinHandle<()>>,
}

/// Coordinates one backend, one registry, one advertisement and at most one
/// discovery round.
pub struct DiscoveryCoordinator {
    backend: Arc<dyn DiscoveryBackend>,
    registry: Arc<ServiceRegistry>,
    discovery_timeout: Option<Duration>,
    advertisement: tokio::sync::Mutex<Option<AdvertisementHandle>>,
    round: Arc<Mutex<RoundState>>,
}

impl DiscoveryCoordinator {
    /// Create a coordinator. `discovery_timeout` of `None` lets rounds run
    /// until the backend completes or `stop_discovering` is called.
    pub fn new(
        backend: Arc<dyn DiscoveryBackend>,
        registry: Arc<ServiceRegistry>,
        discovery_timeout: Option<Duration>,
    ) -> Self {
        Self {
            backend,
            registry,
            discovery_timeout,
            advertisement: tokio::sync::Mutex::new(None),
            round: Arc::new(Mutex::new(RoundState::default())),
        }
    }

    /// Create a coordinator with a fresh registry sized from `config`.
    pub fn from_config(backend: Arc<dyn DiscoveryBackend>, config: &WroupConfig) -> Self {
        let timeout = config.discovery_timeout();
        Self::new(
            backend,
            Arc::new(ServiceRegistry::new(config.event_capacity)),
            (!timeout.is_zero()).then_some(timeout),
        )
    }

    /// The registry this coordinator feeds.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.registry.subscribe()
    }

    /// Whether the local service is advertised.
    pub fn advertising(&self) -> bool {
        self.registry.local_attributes().is_some()
    }

    /// Whether a discovery round is running.
    pub fn discovering(&self) -> bool {
        self.round.lock().unwrap_or_else(|e| e.into_inner()).active
    }

    /// Advertise the local service, replacing any previous advertisement.
    ///
    /// The outcome is also published as `ServiceRegistered` or
    /// `RegistrationFailed`.
    pub async fn start_advertising(&self, attributes: Attributes) -> Result<(), WroupError> {
        let mut current = self.advertisement.lock().await;
        if let Some(old) = current.take() {
            debug!("withdrawing previous advertisement");
            if let Err(e) = self.backend.withdraw(old).await {
                warn!("failed to withdraw previous advertisement: {}", e);
            }
        }

        match self.backend.advertise(&attributes).await {
            Ok(handle) => {
                *current = Some(handle);
                self.registry.advertise_local(attributes);
                self.registry.registration_succeeded();
                Ok(())
            }
            Err(e) => {
                self.registry.clear_local();
                self.registry.registration_failed(e.code());
                Err(e)
            }
        }
    }

    /// Withdraw the local service. No-op when not advertising.
    pub async fn stop_advertising(&self) {
        let mut current = self.advertisement.lock().await;
        let Some(handle) = current.take() else {
            return;
        };
        if let Err(e) = self.backend.withdraw(handle).await {
            warn!("failed to withdraw advertisement: {}", e);
        }
        self.registry.clear_local();
        info!("advertising stopped");
    }

    /// Start a discovery round. A round already in flight is abandoned
    /// without a `DiscoveryFinished`.
    pub fn start_discovering(&self) {
        let mut round = self.round.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = round.task.take() {
            debug!("abandoning in-flight discovery round");
            task.abort();
        }
        round.generation += 1;
        round.active = true;
        self.registry.on_discovery_round_start();
        info!("discovery round started");

        round.task = Some(tokio::spawn(run_round(
            Arc::clone(&self.backend),
            Arc::clone(&self.registry),
            Arc::clone(&self.round),
            round.generation,
            self.discovery_timeout,
        )));
    }

    /// End the current round. Safe to call at any time; a no-op when idle.
    /// Does not wait for the backend.
    pub fn stop_discovering(&self) {
        let mut round = self.round.lock().unwrap_or_else(|e| e.into_inner());
        if !round.active {
            return;
        }
        round.active = false;
        round.generation += 1;
        if let Some(task) = round.task.take() {
            task.abort();
        }
        self.registry.on_discovery_round_end();
        // Under the lock, so it cannot land on a round started after this one.
        self.backend.cancel_browse();
    }
}

impl Drop for DiscoveryCoordinator {
    fn drop(&mut self) {
        let mut round = self.round.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = round.task.take() {
            task.abort();
        }
    }
}

enum RoundOutcome {
    Finished,
    Failed(WroupError),
}

async fn run_round(
    backend: Arc<dyn DiscoveryBackend>,
    registry: Arc<ServiceRegistry>,
    round: Arc<Mutex<RoundState>>,
    generation: u64,
    timeout: Option<Duration>,
) {
    let outcome = match backend.browse().await {
        Err(e) => RoundOutcome::Failed(e),
        Ok(mut sightings) => {
            let deadline = async {
                match timeout {
                    Some(t) => tokio::time::sleep(t).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    item = sightings.next() => match item {
                        Some(Ok(record)) => {
                            let state = round.lock().unwrap_or_else(|e| e.into_inner());
                            if state.generation != generation {
                                return;
                            }
                            registry.record_discovered(record);
                        }
                        Some(Err(e)) => break RoundOutcome::Failed(e),
                        None => {
                            debug!("scan complete");
                            break RoundOutcome::Finished;
                        }
                    },
                    _ = &mut deadline => {
                        debug!("discovery timeout elapsed");
                        break RoundOutcome::Finished;
                    }
                }
            }
        }
    };

    let mut state = round.lock().unwrap_or_else(|e| e.into_inner());
    if state.generation != generation || !state.active {
        return;
    }
    state.active = false;
    state.task = None;
    match outcome {
        RoundOutcome::Finished => {
            registry.on_discovery_round_end();
        }
        RoundOutcome::Failed(e) => {
            warn!("discovery failed: {}", e);
            registry.fail_round(e.code());
        }
    }
    backend.cancel_browse();
}
