//! API server access for policies and VolumeReplications

use crate::crd::{VolumeReplication, VolumeReplicationClass};
use crate::domain::key::ClaimKey;
use crate::domain::ports::{format_label_selector, PolicySource, ReplicationStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::debug;

/// Reads policies and manages VolumeReplications through the API server
#[derive(Clone)]
pub struct KubeReplicationApi {
    client: Client,
}

impl KubeReplicationApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn replications(&self, namespace: &str) -> Api<VolumeReplication> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PolicySource for KubeReplicationApi {
    async fn storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn policies_matching(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<VolumeReplicationClass>> {
        let api: Api<VolumeReplicationClass> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&format_label_selector(labels));
        Ok(api.list(&params).await?.items)
    }
}

#[async_trait]
impl ReplicationStore for KubeReplicationApi {
    async fn get(&self, key: &ClaimKey) -> Result<Option<VolumeReplication>> {
        Ok(self.replications(&key.namespace).get_opt(&key.name).await?)
    }

    async fn create(&self, replication: &VolumeReplication) -> Result<()> {
        let namespace = replication.namespace().ok_or_else(|| {
            Error::Internal(format!(
                "VolumeReplication {} has no namespace",
                replication.name_any()
            ))
        })?;
        self.replications(&namespace)
            .create(&PostParams::default(), replication)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &ClaimKey) -> Result<()> {
        match self
            .replications(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() {
                    debug!("VolumeReplication {} already gone", key);
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}
