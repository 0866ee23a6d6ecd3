//! Leader election
//!
//! Only one replica reconciles at a time. Replicas compete for a
//! `coordination.k8s.io/v1` Lease; the holder renews it every retry period
//! and the others take it over once it has not been renewed for a full lease
//! duration.

use crate::config::LeaderElectionConfig;
use crate::domain::ports::{LeaseStore, LeaseStoreRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client, ResourceExt};
use std::future::Future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What to do with the lease as observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAction {
    /// No lease exists yet
    Create,
    /// We hold the lease
    Renew,
    /// The lease is free or expired
    TakeOver,
    /// Someone else holds a valid lease
    Wait { holder: String },
}

/// Decide how to act on the current lease
pub fn evaluate(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(lease) = lease else {
        return LeaseAction::Create;
    };
    let Some(spec) = lease.spec.as_ref() else {
        return LeaseAction::TakeOver;
    };

    let holder = spec.holder_identity.as_deref().unwrap_or_default();
    if holder.is_empty() {
        return LeaseAction::TakeOver;
    }
    if holder == identity {
        return LeaseAction::Renew;
    }

    let expired = match (&spec.renew_time, spec.lease_duration_seconds) {
        (Some(MicroTime(renewed)), Some(seconds)) => {
            *renewed + chrono::Duration::seconds(i64::from(seconds)) < now
        }
        _ => true,
    };
    if expired {
        LeaseAction::TakeOver
    } else {
        LeaseAction::Wait {
            holder: holder.to_string(),
        }
    }
}

/// Lease objects of one namespace, read and written through the API server
#[derive(Clone)]
pub struct KubeLeaseApi {
    api: Api<Lease>,
}

impl KubeLeaseApi {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseApi {
    async fn get(&self, name: &str) -> Result<Option<Lease>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, lease: &Lease) -> Result<()> {
        self.api.create(&PostParams::default(), lease).await?;
        Ok(())
    }

    async fn replace(&self, lease: &Lease) -> Result<()> {
        // The resource version carried by `lease` makes this a compare-and-swap
        self.api
            .replace(&lease.name_any(), &PostParams::default(), lease)
            .await?;
        Ok(())
    }
}

pub struct LeaderElector {
    leases: LeaseStoreRef,
    config: LeaderElectionConfig,
}

impl LeaderElector {
    pub fn new(leases: LeaseStoreRef, config: LeaderElectionConfig) -> Self {
        Self { leases, config }
    }

    /// Wait for leadership, then run `lead` under a token that is cancelled
    /// when leadership is lost or `shutdown` fires.
    ///
    /// Returns `Ok` on shutdown or when `lead` returns, and an error once the
    /// lease could not be renewed within the renew deadline.
    pub async fn run<F, Fut>(&self, shutdown: CancellationToken, lead: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        info!(
            "Waiting for leadership of lease {}/{} as {}",
            self.config.namespace, self.config.lease_name, self.config.identity
        );
        if !self.acquire(&shutdown).await {
            return Ok(());
        }
        info!("Became leader as {}", self.config.identity);

        let leading = shutdown.child_token();
        let mut task = tokio::spawn(lead(leading.clone()));
        let mut last_renewed = Instant::now();

        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    break Self::join(task).await;
                }
                result = &mut task => {
                    break result
                        .map_err(|e| Error::Internal(format!("Leader task failed: {}", e)))
                        .and_then(|outcome| outcome);
                }
                _ = tokio::time::sleep(self.config.retry_period) => {
                    match self.try_acquire_or_renew().await {
                        Ok(true) => last_renewed = Instant::now(),
                        Ok(false) => {
                            error!("Lease {} was taken over, stepping down", self.config.lease_name);
                            leading.cancel();
                            let _ = Self::join(task).await;
                            return Err(Error::LeaderElection("leadership lost".into()));
                        }
                        Err(e) if last_renewed.elapsed() > self.config.renew_deadline => {
                            error!("Couldn't renew lease within {:?}: {}", self.config.renew_deadline, e);
                            leading.cancel();
                            let _ = Self::join(task).await;
                            return Err(Error::LeaderElection(format!("failed to renew lease: {}", e)));
                        }
                        Err(e) => warn!("Failed to renew lease: {}", e),
                    }
                }
            }
        };

        if self.config.release_on_cancel {
            if let Err(e) = self.release().await {
                warn!("Failed to release lease: {}", e);
            }
        }
        outcome
    }

    async fn join(task: tokio::task::JoinHandle<Result<()>>) -> Result<()> {
        task.await
            .map_err(|e| Error::Internal(format!("Leader task failed: {}", e)))?
    }

    /// Retry until the lease is ours. Returns `false` if shut down first.
    async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        let mut observed: Option<String> = None;
        loop {
            match self.observe().await {
                Ok(LeaseAction::Wait { holder }) => {
                    if observed.as_deref() != Some(holder.as_str()) {
                        info!("Lease is held by {}", holder);
                        observed = Some(holder);
                    }
                }
                Ok(_) => match self.try_acquire_or_renew().await {
                    Ok(true) => return true,
                    Ok(false) => {}
                    Err(e) => warn!("Failed to acquire lease: {}", e),
                },
                Err(e) => warn!("Failed to read lease: {}", e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    async fn observe(&self) -> Result<LeaseAction> {
        let lease = self.leases.get(&self.config.lease_name).await?;
        Ok(evaluate(lease.as_ref(), &self.config.identity, Utc::now()))
    }

    /// One acquire or renew attempt. `Ok(false)` means someone else holds
    /// the lease.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let current = self.leases.get(&self.config.lease_name).await?;
        let action = evaluate(current.as_ref(), &self.config.identity, now);

        let result = match (action, current) {
            (LeaseAction::Wait { .. }, _) => return Ok(false),
            (LeaseAction::Create, _) => self.leases.create(&self.new_lease(now)).await,
            (action, Some(mut lease)) => {
                let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
                if action == LeaseAction::TakeOver {
                    spec.holder_identity = Some(self.config.identity.clone());
                    spec.acquire_time = Some(MicroTime(now));
                    spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
                }
                spec.renew_time = Some(MicroTime(now));
                spec.lease_duration_seconds = Some(self.lease_seconds());
                self.leases.replace(&lease).await
            }
            (_, None) => return Ok(false),
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => {
                debug!("Lost lease update race");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Clear the holder so another replica can take over without waiting
    pub async fn release(&self) -> Result<()> {
        let Some(mut lease) = self.leases.get(&self.config.lease_name).await? else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
            return Ok(());
        }

        spec.holder_identity = None;
        spec.lease_duration_seconds = Some(1);
        spec.renew_time = Some(MicroTime(Utc::now()));
        self.leases.replace(&lease).await?;
        info!("Released lease {}", self.config.lease_name);
        Ok(())
    }

    fn new_lease(&self, now: DateTime<Utc>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.config.lease_name.clone()),
                namespace: Some(self.config.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.config.identity.clone()),
                lease_duration_seconds: Some(self.lease_seconds()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        }
    }

    fn lease_seconds(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }
}
