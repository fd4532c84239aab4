//! Authorization engine.
//!
//! Resolves bearer session ids into identities and evaluates named
//! permissions against a scope (server-wide or one product). The
//! effective permission set is the union of direct grants, group
//! grants, and the transitive closure of the implication edges defined
//! on [`Permission`].

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};
use verdict_protocol::{defaults, ApiError, Permission};
use verdict_store::ConfigStore;

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct Identity {
    pub username: String,
    pub groups: Vec<String>,
    /// Session expiry; `None` for the synthetic identity used when
    /// authentication is disabled.
    pub expires_at: Option<i64>,
    /// Set when authentication is disabled: the identity holds
    /// SUPERUSER without any stored grant.
    pub synthetic: bool,
}

pub struct AuthEngine {
    store: ConfigStore,
    disabled: bool,
    idle_secs: i64,
    max_secs: i64,
}

impl AuthEngine {
    pub fn new(store: ConfigStore, disabled: bool) -> Self {
        Self {
            store,
            disabled,
            idle_secs: defaults::DEFAULT_SESSION_IDLE_SECS,
            max_secs: defaults::DEFAULT_SESSION_MAX_SECS,
        }
    }

    /// First-boot provisioning: when authentication is on and no root
    /// account exists, mint one and leave its generated password in
    /// `root.credentials` under the Verdict home.
    pub async fn bootstrap_root(&self, home: &Path) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        let auth = self.store.auth();
        if auth.get_account("root").await?.is_some() {
            return Ok(());
        }

        let password = uuid::Uuid::new_v4().simple().to_string();
        let salt = uuid::Uuid::new_v4().simple().to_string();
        let digest = hash_password(&salt, &password);
        auth.upsert_account("root", &salt, &digest, &[]).await?;
        auth.add_grant(Permission::Superuser, None, "root", false)
            .await?;

        let credentials_path = home.join("root.credentials");
        let mut file = std::fs::File::create(&credentials_path)
            .with_context(|| format!("Failed to write {}", credentials_path.display()))?;
        writeln!(file, "root:{password}")?;
        restrict_permissions(&credentials_path)?;
        info!(
            "Generated root superuser; credentials at {}",
            credentials_path.display()
        );
        Ok(())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<String, ApiError> {
        if self.disabled {
            return Err(ApiError::unauthorized(
                "authentication is disabled on this server",
            ));
        }
        let auth = self.store.auth();
        let Some(account) = auth.get_account(username).await.map_err(ApiError::from)? else {
            return Err(ApiError::unauthorized("invalid credentials"));
        };
        if hash_password(&account.password_salt, password) != account.password_digest {
            warn!("Failed login attempt for '{}'", username);
            return Err(ApiError::unauthorized("invalid credentials"));
        }

        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let now = verdict_store::now_secs();
        auth.create_session(&session_id, username, now + self.idle_secs)
            .await
            .map_err(ApiError::from)?;
        Ok(session_id)
    }

    pub async fn logout(&self, session_id: &str) -> Result<bool, ApiError> {
        self.store
            .auth()
            .delete_session(session_id)
            .await
            .map_err(ApiError::from)
    }

    /// Resolve the caller's identity from the bearer session id,
    /// refreshing the session on use. Both the idle and the absolute
    /// timeout apply.
    pub async fn resolve_identity(&self, session: Option<&str>) -> Result<Identity, ApiError> {
        if self.disabled {
            return Ok(Identity {
                username: "anonymous".to_string(),
                groups: Vec::new(),
                expires_at: None,
                synthetic: true,
            });
        }

        let Some(session_id) = session else {
            return Err(ApiError::unauthorized("missing session"));
        };
        let auth = self.store.auth();
        let Some(row) = auth.get_session(session_id).await.map_err(ApiError::from)? else {
            return Err(ApiError::unauthorized("unknown session"));
        };

        let now = verdict_store::now_secs();
        if row.expires_at <= now {
            let _ = auth.delete_session(session_id).await;
            return Err(ApiError::unauthorized("session expired"));
        }

        // Sliding refresh, capped by the absolute bound.
        let refreshed = (now + self.idle_secs).min(row.issued_at + self.max_secs);
        auth.touch_session(session_id, refreshed)
            .await
            .map_err(ApiError::from)?;

        let groups = match auth.get_account(&row.username).await.map_err(ApiError::from)? {
            Some(account) => account.groups().map_err(ApiError::from)?,
            None => Vec::new(),
        };

        Ok(Identity {
            username: row.username,
            groups,
            expires_at: Some(refreshed),
            synthetic: false,
        })
    }

    /// Effective permissions for an identity on a scope.
    pub async fn permissions_for(
        &self,
        identity: &Identity,
        product: Option<&str>,
    ) -> Result<Vec<Permission>, ApiError> {
        if identity.synthetic {
            let mut all: Vec<Permission> = Permission::ALL.to_vec();
            if product.is_none() {
                all.retain(|p| *p == Permission::Superuser);
            }
            return Ok(all);
        }

        let grants = self
            .store
            .auth()
            .grants_for_identity(&identity.username, &identity.groups)
            .await
            .map_err(ApiError::from)?;

        let mut direct: HashSet<Permission> = HashSet::new();
        for grant in grants {
            let permission = grant.parsed_permission().map_err(ApiError::from)?;
            let in_scope = match (&grant.product_endpoint, product) {
                // Server-wide grants reach every scope.
                (None, _) => true,
                (Some(scope), Some(target)) => scope == target,
                (Some(_), None) => false,
            };
            if in_scope {
                direct.insert(permission);
            }
        }

        let mut effective = closure(direct);
        if product.is_none() {
            // Product-scoped permission names make no sense server-wide.
            effective.retain(|p| *p == Permission::Superuser);
        }
        let mut sorted: Vec<Permission> = effective.into_iter().collect();
        sorted.sort_by_key(|p| p.as_str());
        Ok(sorted)
    }

    pub async fn has_permission(
        &self,
        identity: &Identity,
        permission: Permission,
        product: Option<&str>,
    ) -> Result<bool, ApiError> {
        if identity.synthetic {
            return Ok(true);
        }
        let effective = self.permissions_for(identity, product).await?;
        Ok(effective.contains(&permission))
    }

    pub async fn is_superuser(&self, identity: &Identity) -> Result<bool, ApiError> {
        if identity.synthetic {
            return Ok(true);
        }
        let effective = self.permissions_for(identity, None).await?;
        Ok(effective.contains(&Permission::Superuser))
    }

    pub async fn purge_expired_sessions(&self) -> Result<u64, ApiError> {
        self.store
            .auth()
            .purge_expired_sessions()
            .await
            .map_err(ApiError::from)
    }
}

/// Transitive closure over the permission implication edges.
fn closure(direct: HashSet<Permission>) -> HashSet<Permission> {
    let mut effective = direct;
    let mut frontier: Vec<Permission> = effective.iter().copied().collect();
    while let Some(permission) = frontier.pop() {
        for implied in permission.implied() {
            if effective.insert(*implied) {
                frontier.push(*implied);
            }
        }
    }
    effective
}

/// Salted SHA-256 digest, hex-encoded.
pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
