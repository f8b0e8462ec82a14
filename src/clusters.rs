//! Cluster membership helpers
//!
//! Membership changes read the whole cluster record, change its `hostset`
//! and write it back. There is no compare-and-swap: two concurrent changes
//! to the same cluster can lose one update, and two concurrent adds of the
//! same address to different clusters can both succeed.

use tracing::debug;

use crate::model::Cluster;
use crate::store::{StoreError, StoreManager};

/// The cluster whose hostset contains `address`, if any
pub async fn cluster_for_host(
    store: &StoreManager,
    address: &str,
) -> Result<Option<Cluster>, StoreError> {
    let clusters = store.list::<Cluster>().await?;
    Ok(clusters.into_iter().find(|c| c.contains(address)))
}

pub async fn cluster_has_host(
    store: &StoreManager,
    name: &str,
    address: &str,
) -> Result<bool, StoreError> {
    Ok(store.get::<Cluster>(name).await?.contains(address))
}

pub async fn add_host_to_cluster(
    store: &StoreManager,
    name: &str,
    address: &str,
) -> Result<Cluster, StoreError> {
    let mut cluster = store.get::<Cluster>(name).await?;
    if cluster.hostset.insert(address.to_string()) {
        debug!("Adding {} to cluster {}", address, name);
        cluster = store.save(&cluster).await?;
    }
    Ok(cluster)
}

pub async fn remove_host_from_cluster(
    store: &StoreManager,
    name: &str,
    address: &str,
) -> Result<Cluster, StoreError> {
    let mut cluster = store.get::<Cluster>(name).await?;
    if cluster.hostset.remove(address) {
        debug!("Removing {} from cluster {}", address, name);
        cluster = store.save(&cluster).await?;
    }
    Ok(cluster)
}

/// Drop `address` from every cluster containing it. Returns the names of the
/// clusters that changed.
pub async fn remove_host_from_all_clusters(
    store: &StoreManager,
    address: &str,
) -> Result<Vec<String>, StoreError> {
    let mut changed = Vec::new();
    for mut cluster in store.list::<Cluster>().await? {
        if cluster.hostset.remove(address) {
            store.save(&cluster).await?;
            changed.push(cluster.name);
        }
    }
    Ok(changed)
}
