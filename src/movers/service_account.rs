//! ServiceAccount the mover Pod runs as
//!
//! Privileged movers also get a Role and RoleBinding allowing them to use
//! the privileged SecurityContextConstraints.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};

use crate::adapters::ResourceClient;
use crate::error::{Error, Result};
use crate::resources::{create_or_update, set_owned_by, Owner, Readiness};

/// SCC the privileged mover Role grants `use` on
pub const PRIVILEGED_SCC: &str = "volsync-privileged-mover";

/// Ensure the ServiceAccount (and RBAC when privileged) the mover runs as
///
/// A user supplied `mover_service_account` is used as is and must exist.
pub async fn ensure_service_account(
    client: &ResourceClient,
    owner: &Owner,
    name: &str,
    privileged: bool,
    mover_service_account: Option<&str>,
) -> Result<Readiness<ServiceAccount>> {
    if let Some(user_sa) = mover_service_account {
        return match client.get::<ServiceAccount>(&owner.namespace, user_sa).await? {
            Some(sa) => Ok(Readiness::Ready(sa)),
            None => Err(Error::validation(format!(
                "moverServiceAccount {} not found",
                user_sa
            ))),
        };
    }

    let (sa, _) = create_or_update::<ServiceAccount, _>(client, &owner.namespace, name, |sa| {
        set_owned_by(&mut sa.metadata, owner);
        Ok(())
    })
    .await?;

    if privileged {
        ensure_privileged_rbac(client, owner, name).await?;
    }
    Ok(Readiness::Ready(sa))
}

async fn ensure_privileged_rbac(client: &ResourceClient, owner: &Owner, name: &str) -> Result<()> {
    create_or_update::<Role, _>(client, &owner.namespace, name, |role| {
        set_owned_by(&mut role.metadata, owner);
        role.rules = Some(vec![PolicyRule {
            api_groups: Some(vec!["security.openshift.io".to_string()]),
            resources: Some(vec!["securitycontextconstraints".to_string()]),
            resource_names: Some(vec![PRIVILEGED_SCC.to_string()]),
            verbs: vec!["use".to_string()],
            ..Default::default()
        }]);
        Ok(())
    })
    .await?;

    create_or_update::<RoleBinding, _>(client, &owner.namespace, name, |binding| {
        set_owned_by(&mut binding.metadata, owner);
        binding.role_ref = RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.to_string(),
        };
        binding.subjects = Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: name.to_string(),
            namespace: Some(owner.namespace.clone()),
            ..Default::default()
        }]);
        Ok(())
    })
    .await?;
    Ok(())
}
