/**
 * TENANT DIRECTORY - Provisioning tenants, credentials et topologie
 *
 * RÔLE :
 * Émission/rotation/révocation des credentials (le binding ACL = scope du
 * credential, muté seulement à la rotation), et topologie
 * device → group → organization → tenant consommée par l'agrégation santé.
 */

use crate::errors::CoreError;
use crate::state::{new_map, Shared};
use crate::subjects::Scope;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub scope: Scope,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    pub revoked: bool,
}

/// Magasin de credentials, révocables indépendamment.
#[derive(Clone)]
pub struct CredentialStore {
    creds: Shared<HashMap<String, Credential>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self { creds: new_map() }
    }

    pub fn issue(&self, scope: Scope) -> Credential {
        let cred = Credential {
            token: Uuid::new_v4().to_string(),
            scope,
            issued_at: OffsetDateTime::now_utc(),
            revoked: false,
        };
        self.creds.lock().insert(cred.token.clone(), cred.clone());
        cred
    }

    /// Résout un token. Inconnu ou révoqué = refus d'autorisation.
    pub fn check(&self, token: &str) -> Result<Credential, CoreError> {
        let creds = self.creds.lock();
        match creds.get(token) {
            Some(c) if !c.revoked => Ok(c.clone()),
            Some(_) => Err(CoreError::Authorization("credential revoked".into())),
            None => Err(CoreError::Authorization("unknown credential".into())),
        }
    }

    pub fn revoke(&self, token: &str) {
        if let Some(c) = self.creds.lock().get_mut(token) {
            c.revoked = true;
        }
    }

    /// Vrai si un credential device actif lie (tenant, device). C'est le
    /// contrôle d'accréditation du dispatcher : un message device entrant
    /// sans credential actif n'atteint ni le log durable ni les abonnés.
    pub fn device_active(&self, tenant: &str, device: &str) -> bool {
        self.creds.lock().values().any(|c| {
            !c.revoked
                && matches!(&c.scope,
                    Scope::Device { tenant: t, device: d } if t == tenant && d == device)
        })
    }

    /// Révoque tous les credentials d'un device (décommission).
    pub fn revoke_device(&self, tenant: &str, device: &str) {
        let mut creds = self.creds.lock();
        for c in creds.values_mut() {
            if let Scope::Device { tenant: t, device: d } = &c.scope {
                if t == tenant && d == device {
                    c.revoked = true;
                }
            }
        }
    }

    /// Rotation : révoque l'ancien token et en émet un neuf, même scope.
    pub fn rotate(&self, token: &str) -> Result<Credential, CoreError> {
        let scope = self.check(token)?.scope;
        self.revoke(token);
        Ok(self.issue(scope))
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub credential_token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Rattachement d'un device dans la hiérarchie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub tenant: String,
    pub org: String,
    pub group: String,
}

#[derive(Clone)]
pub struct TenantDirectory {
    tenants: Shared<HashMap<String, TenantRecord>>,
    memberships: Shared<HashMap<String, Membership>>,
    creds: CredentialStore,
}

impl TenantDirectory {
    pub fn new(creds: CredentialStore) -> Self {
        Self { tenants: new_map(), memberships: new_map(), creds }
    }

    /// Provisionne un tenant : credential scoped + record. Le log durable
    /// correspondant est créé par le bus au même moment (voir bootstrap).
    pub fn provision_tenant(&self, tenant_id: &str) -> Result<Credential, CoreError> {
        let mut tenants = self.tenants.lock();
        if tenants.contains_key(tenant_id) {
            return Err(CoreError::Schema(format!("tenant '{tenant_id}' already provisioned")));
        }
        let cred = self.creds.issue(Scope::Tenant { tenant: tenant_id.to_string() });
        tenants.insert(
            tenant_id.to_string(),
            TenantRecord {
                tenant_id: tenant_id.to_string(),
                credential_token: cred.token.clone(),
                created_at: OffsetDateTime::now_utc(),
            },
        );
        info!("provisioned tenant {tenant_id}");
        Ok(cred)
    }

    pub fn is_provisioned(&self, tenant_id: &str) -> bool {
        self.tenants.lock().contains_key(tenant_id)
    }

    /// Rotation du credential tenant : seul cas où le binding ACL est muté.
    pub fn rotate_tenant(&self, tenant_id: &str) -> Result<Credential, CoreError> {
        let old_token = {
            let tenants = self.tenants.lock();
            tenants
                .get(tenant_id)
                .map(|t| t.credential_token.clone())
                .ok_or_else(|| CoreError::Schema(format!("unknown tenant '{tenant_id}'")))?
        };
        let cred = self.creds.rotate(&old_token)?;
        self.tenants.lock().get_mut(tenant_id).map(|t| t.credential_token = cred.token.clone());
        info!("rotated credentials for tenant {tenant_id}");
        Ok(cred)
    }

    pub fn list_tenants(&self) -> Vec<String> {
        self.tenants.lock().keys().cloned().collect()
    }

    /// Rattache un device. Un device déjà rattaché à un AUTRE tenant n'est
    /// jamais réassigné silencieusement.
    pub fn assign_device(
        &self,
        device: &str,
        membership: Membership,
    ) -> Result<(), CoreError> {
        let mut memberships = self.memberships.lock();
        if let Some(existing) = memberships.get(device) {
            if existing.tenant != membership.tenant {
                return Err(CoreError::Authorization(format!(
                    "device '{device}' already belongs to tenant '{}'",
                    existing.tenant
                )));
            }
        }
        memberships.insert(device.to_string(), membership);
        Ok(())
    }

    pub fn membership(&self, device: &str) -> Option<Membership> {
        self.memberships.lock().get(device).cloned()
    }

    pub fn remove_device(&self, device: &str) {
        self.memberships.lock().remove(device);
    }

    pub fn group_devices(&self, tenant: &str, group: &str) -> Vec<String> {
        self.memberships
            .lock()
            .iter()
            .filter(|(_, m)| m.tenant == tenant && m.group == group)
            .map(|(d, _)| d.clone())
            .collect()
    }

    pub fn org_groups(&self, tenant: &str, org: &str) -> Vec<String> {
        let mut groups: Vec<String> = self
            .memberships
            .lock()
            .values()
            .filter(|m| m.tenant == tenant && m.org == org)
            .map(|m| m.group.clone())
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }

    pub fn tenant_orgs(&self, tenant: &str) -> Vec<String> {
        let mut orgs: Vec<String> = self
            .memberships
            .lock()
            .values()
            .filter(|m| m.tenant == tenant)
            .map(|m| m.org.clone())
            .collect();
        orgs.sort();
        orgs.dedup();
        orgs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(tenant: &str, org: &str, group: &str) -> Membership {
        Membership {
            tenant: tenant.to_string(),
            org: org.to_string(),
            group: group.to_string(),
        }
    }

    #[test]
    fn test_issue_check_revoke() {
        let store = CredentialStore::new();
        let cred = store.issue(Scope::Tenant { tenant: "t1".into() });
        assert!(store.check(&cred.token).is_ok());

        store.revoke(&cred.token);
        assert!(matches!(store.check(&cred.token), Err(CoreError::Authorization(_))));
        assert!(matches!(store.check("nope"), Err(CoreError::Authorization(_))));
    }

    #[test]
    fn test_rotation_keeps_scope_kills_old_token() {
        let store = CredentialStore::new();
        let old = store.issue(Scope::Tenant { tenant: "t1".into() });
        let fresh = store.rotate(&old.token).unwrap();
        assert_ne!(old.token, fresh.token);
        assert_eq!(fresh.scope, Scope::Tenant { tenant: "t1".into() });
        assert!(store.check(&old.token).is_err());
        assert!(store.check(&fresh.token).is_ok());
    }

    #[test]
    fn test_provision_is_unique() {
        let dir = TenantDirectory::new(CredentialStore::new());
        let cred = dir.provision_tenant("acme").unwrap();
        assert_eq!(cred.scope, Scope::Tenant { tenant: "acme".into() });
        assert!(dir.provision_tenant("acme").is_err());
    }

    #[test]
    fn test_device_never_silently_reassigned() {
        let dir = TenantDirectory::new(CredentialStore::new());
        dir.assign_device("dev-1", membership("t1", "org-a", "g1")).unwrap();
        // Même tenant : changement de groupe autorisé.
        dir.assign_device("dev-1", membership("t1", "org-a", "g2")).unwrap();
        // Autre tenant : refus explicite.
        assert!(dir.assign_device("dev-1", membership("t2", "org-x", "g1")).is_err());
        assert_eq!(dir.membership("dev-1").unwrap().group, "g2");
    }

    #[test]
    fn test_topology_accessors() {
        let dir = TenantDirectory::new(CredentialStore::new());
        dir.assign_device("d1", membership("t1", "org-a", "g1")).unwrap();
        dir.assign_device("d2", membership("t1", "org-a", "g1")).unwrap();
        dir.assign_device("d3", membership("t1", "org-b", "g2")).unwrap();

        let mut devices = dir.group_devices("t1", "g1");
        devices.sort();
        assert_eq!(devices, vec!["d1", "d2"]);
        assert_eq!(dir.org_groups("t1", "org-a"), vec!["g1"]);
        assert_eq!(dir.tenant_orgs("t1"), vec!["org-a", "org-b"]);
        assert!(dir.group_devices("t2", "g1").is_empty());
    }

    #[test]
    fn test_revoke_device_credentials() {
        let store = CredentialStore::new();
        let cred = store.issue(Scope::Device { tenant: "t1".into(), device: "d1".into() });
        store.revoke_device("t1", "d1");
        assert!(store.check(&cred.token).is_err());
    }

    #[test]
    fn test_device_active_tracks_issuance_and_revocation() {
        let store = CredentialStore::new();
        assert!(!store.device_active("t1", "d1"));

        store.issue(Scope::Device { tenant: "t1".into(), device: "d1".into() });
        assert!(store.device_active("t1", "d1"));
        // Le binding est exact : ni un autre device, ni un autre tenant.
        assert!(!store.device_active("t1", "d2"));
        assert!(!store.device_active("t2", "d1"));

        store.revoke_device("t1", "d1");
        assert!(!store.device_active("t1", "d1"));
    }
}
