//! Removal of per-synchronization objects

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use super::common::{
    cleanup_selector, is_do_not_delete, remove_owned_by, unmark_for_cleanup, Owner,
};
use crate::adapters::{KubeObject, ResourceClient};
use crate::crd::VolumeSnapshot;
use crate::error::Result;

/// Delete every Job, PVC and VolumeSnapshot marked for cleanup by `owner`
///
/// Objects labelled do-not-delete are released instead: the cleanup label
/// and the owner reference are removed so they outlive the owner.
pub async fn cleanup_objects(client: &ResourceClient, owner: &Owner) -> Result<()> {
    sweep::<Job>(client, owner).await?;
    sweep::<PersistentVolumeClaim>(client, owner).await?;
    sweep::<VolumeSnapshot>(client, owner).await?;
    Ok(())
}

async fn sweep<K: KubeObject>(client: &ResourceClient, owner: &Owner) -> Result<()> {
    let kind = K::kind(&());
    let objects = match client.list::<K>(&owner.namespace, &cleanup_selector(owner)).await {
        Ok(objects) => objects,
        // the kind may not be served in this cluster (no snapshot CRDs)
        Err(e) if e.is_not_found() => {
            debug!(kind = %kind, "Kind not available, nothing to clean up");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    for obj in objects {
        let name = obj.name_any();
        if is_do_not_delete(obj.meta()) {
            let mut released = obj.clone();
            unmark_for_cleanup(released.meta_mut());
            remove_owned_by(released.meta_mut(), &owner.uid);
            client.replace(&released).await?;
            info!(kind = %kind, name = %name, "Released object marked do-not-delete");
            continue;
        }
        client.delete::<K>(&owner.namespace, &name).await?;
        debug!(kind = %kind, name = %name, "Deleted temporary object");
    }
    Ok(())
}
