//! In-memory cluster used by the replicator tests

use crate::config::{
    PARENT_LABEL, POLICY_SELECTOR_ANNOTATION, STORAGE_CLASS_GROUP_LABEL,
};
use crate::crd::{
    DataSourceReference, ReplicationState, VolumeReplication, VolumeReplicationClass,
    VolumeReplicationClassSpec, VolumeReplicationSpec,
};
use crate::domain::key::ClaimKey;
use crate::domain::ports::{LeaseStore, PolicySource, ReplicationStore, ResourceCache};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Namespace, PersistentVolumeClaim, PersistentVolumeClaimSpec,
};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};
use kube::api::ObjectMeta;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Mutating call recorded by [`FakeCluster`]
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create(VolumeReplication),
    Delete(ClaimKey),
}

/// Implements every port over plain maps and records mutating calls
#[derive(Default)]
pub struct FakeCluster {
    claims: Mutex<BTreeMap<ClaimKey, PersistentVolumeClaim>>,
    namespaces: Mutex<BTreeMap<String, Namespace>>,
    storage_classes: Mutex<BTreeMap<String, StorageClass>>,
    policies: Mutex<Vec<VolumeReplicationClass>>,
    replications: Mutex<BTreeMap<ClaimKey, VolumeReplication>>,
    calls: Mutex<Vec<Call>>,
    pub fail_get: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_list: AtomicBool,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_claim(&self, claim: PersistentVolumeClaim) {
        self.claims.lock().insert(ClaimKey::of(&claim), claim);
    }

    pub fn remove_claim(&self, key: &ClaimKey) {
        self.claims.lock().remove(key);
    }

    pub fn put_namespace(&self, namespace: Namespace) {
        let name = namespace.metadata.name.clone().unwrap_or_default();
        self.namespaces.lock().insert(name, namespace);
    }

    pub fn put_storage_class(&self, class: StorageClass) {
        let name = class.metadata.name.clone().unwrap_or_default();
        self.storage_classes.lock().insert(name, class);
    }

    pub fn put_policy(&self, policy: VolumeReplicationClass) {
        self.policies.lock().push(policy);
    }

    pub fn put_replication(&self, replication: VolumeReplication) {
        self.replications
            .lock()
            .insert(ClaimKey::of(&replication), replication);
    }

    pub fn replication(&self, key: &ClaimKey) -> Option<VolumeReplication> {
        self.replications.lock().get(key).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

/// Whether `labels` contains every pair of `selector`, as an equality label
/// selector would match
pub fn labels_match(
    labels: Option<&BTreeMap<String, String>>,
    selector: &BTreeMap<String, String>,
) -> bool {
    selector.iter().all(|(key, value)| {
        labels
            .and_then(|labels| labels.get(key))
            .is_some_and(|actual| actual == value)
    })
}

pub fn api_error(code: u16) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".into(),
        message: "injected failure".into(),
        reason: "InternalError".into(),
        code,
    }))
}

impl ResourceCache for FakeCluster {
    fn claim(&self, key: &ClaimKey) -> Option<PersistentVolumeClaim> {
        self.claims.lock().get(key).cloned()
    }

    fn namespace(&self, name: &str) -> Option<Namespace> {
        self.namespaces.lock().get(name).cloned()
    }

    fn claims_in_namespace(&self, namespace: &str) -> Vec<ClaimKey> {
        self.claims
            .lock()
            .keys()
            .filter(|key| key.namespace == namespace)
            .cloned()
            .collect()
    }

    fn claim_keys(&self) -> Vec<ClaimKey> {
        self.claims.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl PolicySource for FakeCluster {
    async fn storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        Ok(self.storage_classes.lock().get(name).cloned())
    }

    async fn policies_matching(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<VolumeReplicationClass>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(api_error(500));
        }
        Ok(self
            .policies
            .lock()
            .iter()
            .filter(|policy| labels_match(policy.metadata.labels.as_ref(), labels))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ReplicationStore for FakeCluster {
    async fn get(&self, key: &ClaimKey) -> Result<Option<VolumeReplication>> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(api_error(503));
        }
        Ok(self.replications.lock().get(key).cloned())
    }

    async fn create(&self, replication: &VolumeReplication) -> Result<()> {
        self.calls.lock().push(Call::Create(replication.clone()));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(api_error(500));
        }
        let key = ClaimKey::of(replication);
        let mut replications = self.replications.lock();
        if replications.contains_key(&key) {
            return Err(api_error(409));
        }
        replications.insert(key, replication.clone());
        Ok(())
    }

    async fn delete(&self, key: &ClaimKey) -> Result<()> {
        self.calls.lock().push(Call::Delete(key.clone()));
        self.replications.lock().remove(key);
        Ok(())
    }
}

// =============================================================================
// Object builders
// =============================================================================

fn string_map(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
    if pairs.is_empty() {
        return None;
    }
    Some(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

pub fn claim(namespace: &str, name: &str, annotations: &[(&str, &str)]) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            annotations: string_map(annotations),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec::default()),
        ..Default::default()
    }
}

pub fn with_storage_class(mut claim: PersistentVolumeClaim, class: &str) -> PersistentVolumeClaim {
    claim
        .spec
        .get_or_insert_with(Default::default)
        .storage_class_name = Some(class.into());
    claim
}

pub fn with_labels(mut claim: PersistentVolumeClaim, labels: &[(&str, &str)]) -> PersistentVolumeClaim {
    claim.metadata.labels = string_map(labels);
    claim
}

pub fn terminating(mut claim: PersistentVolumeClaim) -> PersistentVolumeClaim {
    claim.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    claim
}

pub fn namespace(name: &str, annotations: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.into()),
            annotations: string_map(annotations),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn storage_class(name: &str, group: Option<&str>) -> StorageClass {
    let labels = group.map(|group| [(STORAGE_CLASS_GROUP_LABEL, group)]);
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.into()),
            labels: labels.and_then(|labels| string_map(&labels)),
            ..Default::default()
        },
        provisioner: "rbd.csi.ceph.com".into(),
        ..Default::default()
    }
}

pub fn policy(name: &str, group: &str, selector: &str, provisioner: &str) -> VolumeReplicationClass {
    let mut class = VolumeReplicationClass::new(
        name,
        VolumeReplicationClassSpec {
            provisioner: provisioner.into(),
            parameters: BTreeMap::new(),
        },
    );
    class.metadata.labels = string_map(&[
        (STORAGE_CLASS_GROUP_LABEL, group),
        (POLICY_SELECTOR_ANNOTATION, selector),
    ]);
    class
}

/// Replication as this controller would have created it
pub fn owned_replication(namespace: &str, name: &str, policy: &str) -> VolumeReplication {
    let mut replication = unowned_replication(namespace, name, policy);
    replication.metadata.labels = string_map(&[(PARENT_LABEL, name)]);
    replication
}

pub fn unowned_replication(namespace: &str, name: &str, policy: &str) -> VolumeReplication {
    let mut replication = VolumeReplication::new(
        name,
        VolumeReplicationSpec {
            volume_replication_class: policy.into(),
            replication_state: ReplicationState::Primary,
            data_source: DataSourceReference::claim(name),
            auto_resync: None,
        },
    );
    replication.metadata.namespace = Some(namespace.into());
    replication
}

// =============================================================================
// Leases
// =============================================================================

/// Single Lease held in memory with API server write semantics: every write
/// bumps the resource version and a replace carrying an old version conflicts.
#[derive(Default)]
pub struct MemoryLeases {
    lease: Mutex<Option<Lease>>,
    version: AtomicU64,
    /// Fail the next write with a conflict
    pub conflict_next: AtomicBool,
    /// Fail every call as unavailable
    pub fail: AtomicBool,
}

impl MemoryLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `lease` as if another replica had written it
    pub fn seed(&self, mut lease: Lease) {
        lease.metadata.resource_version = Some(self.next_version());
        *self.lease.lock() = Some(lease);
    }

    pub fn lease(&self) -> Option<Lease> {
        self.lease.lock().clone()
    }

    pub fn holder(&self) -> Option<String> {
        self.lease()
            .and_then(|lease| lease.spec)
            .and_then(|spec| spec.holder_identity)
    }

    /// Let `holder` renew the lease right now
    pub fn steal(&self, holder: &str) {
        let mut lease = self.lease().unwrap_or_default();
        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        spec.holder_identity = Some(holder.to_string());
        spec.renew_time = Some(MicroTime(chrono::Utc::now()));
        spec.lease_duration_seconds = Some(15);
        self.seed(lease);
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn check_write(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(api_error(503));
        }
        if self.conflict_next.swap(false, Ordering::SeqCst) {
            return Err(api_error(409));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeases {
    async fn get(&self, _name: &str) -> Result<Option<Lease>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(api_error(503));
        }
        Ok(self.lease())
    }

    async fn create(&self, lease: &Lease) -> Result<()> {
        self.check_write()?;
        let mut current = self.lease.lock();
        if current.is_some() {
            return Err(api_error(409));
        }
        let mut lease = lease.clone();
        lease.metadata.resource_version = Some(self.next_version());
        *current = Some(lease);
        Ok(())
    }

    async fn replace(&self, lease: &Lease) -> Result<()> {
        self.check_write()?;
        let mut current = self.lease.lock();
        let Some(stored) = current.as_ref() else {
            return Err(api_error(404));
        };
        if stored.metadata.resource_version != lease.metadata.resource_version {
            return Err(api_error(409));
        }
        let mut lease = lease.clone();
        lease.metadata.resource_version = Some(self.next_version());
        *current = Some(lease);
        Ok(())
    }
}

#[test]
fn test_labels_match() {
    let selector = BTreeMap::from([
        ("group".to_string(), "ceph".to_string()),
        ("selector".to_string(), "daily".to_string()),
    ]);

    let mut labels = selector.clone();
    labels.insert("extra".into(), "x".into());
    assert!(labels_match(Some(&labels), &selector));

    labels.insert("selector".into(), "hourly".into());
    assert!(!labels_match(Some(&labels), &selector));
    assert!(!labels_match(None, &selector));
    assert!(labels_match(None, &BTreeMap::new()));
}
