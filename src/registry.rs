//! Registered-application catalog.
//!
//! Applications are declared in a JSON file owned by operations. The
//! registry keeps an in-memory snapshot and re-reads the file only when
//! its modification time changes, so a running broker picks up edits
//! without a restart and without re-parsing on every request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use serde::Deserialize;
use tracing::{info, warn};

use crate::auth::error::AuthError;

/// One application as declared in the registry file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppRegistration {
    pub app_id: String,
    pub name: String,
    /// bcrypt hash of the client secret presented at token exchange.
    pub client_secret_hash: String,
    pub redirect_uri: String,
    /// Empty means every department is admitted.
    #[serde(default)]
    pub allowed_depts: Vec<String>,
    /// Minimum staff level; 0 admits everyone.
    #[serde(default)]
    pub min_level: i32,
}

impl AppRegistration {
    /// Constant-cost on failure is not required here: app identity is
    /// public, only the secret comparison itself must be bcrypt.
    #[must_use]
    pub fn verify_client_secret(&self, client_secret: &str) -> bool {
        bcrypt::verify(client_secret, &self.client_secret_hash).unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    apps: HashMap<String, AppRegistration>,
    mtime: Option<SystemTime>,
}

/// File-backed registry with mtime-gated refresh.
#[derive(Debug)]
pub struct AppRegistry {
    path: PathBuf,
    snapshot: RwLock<Snapshot>,
}

impl AppRegistry {
    /// Load the registry file eagerly so a missing or malformed file
    /// fails startup instead of the first request.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuthError> {
        let registry = Self {
            path: path.into(),
            snapshot: RwLock::new(Snapshot::default()),
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Re-read the file if its mtime moved since the last load.
    pub fn refresh(&self) -> Result<(), AuthError> {
        let mtime = file_mtime(&self.path)?;
        {
            let snapshot = self
                .snapshot
                .read()
                .map_err(|_| AuthError::UpstreamUnavailable("registry lock poisoned".into()))?;
            if snapshot.mtime == Some(mtime) {
                return Ok(());
            }
        }
        self.reload()
    }

    fn reload(&self) -> Result<(), AuthError> {
        let mtime = file_mtime(&self.path)?;
        let raw = std::fs::read_to_string(&self.path).map_err(|err| {
            AuthError::UpstreamUnavailable(format!("registry {}: {err}", self.path.display()))
        })?;
        let entries: Vec<AppRegistration> = serde_json::from_str(&raw).map_err(|err| {
            AuthError::UpstreamUnavailable(format!("registry {}: {err}", self.path.display()))
        })?;

        let mut apps = HashMap::with_capacity(entries.len());
        for app in entries {
            if apps.insert(app.app_id.clone(), app).is_some() {
                warn!("Duplicate app_id in registry, last entry wins");
            }
        }

        let mut snapshot = self
            .snapshot
            .write()
            .map_err(|_| AuthError::UpstreamUnavailable("registry lock poisoned".into()))?;
        info!(apps = apps.len(), path = %self.path.display(), "App registry loaded");
        snapshot.apps = apps;
        snapshot.mtime = Some(mtime);
        Ok(())
    }

    /// Refresh then look up. Unknown app → `None`.
    pub fn find(&self, app_id: &str) -> Result<Option<AppRegistration>, AuthError> {
        self.refresh()?;
        let snapshot = self
            .snapshot
            .read()
            .map_err(|_| AuthError::UpstreamUnavailable("registry lock poisoned".into()))?;
        Ok(snapshot.apps.get(app_id).cloned())
    }

    /// All registered apps, for accessible-app listings.
    pub fn all(&self) -> Result<Vec<AppRegistration>, AuthError> {
        self.refresh()?;
        let snapshot = self
            .snapshot
            .read()
            .map_err(|_| AuthError::UpstreamUnavailable("registry lock poisoned".into()))?;
        Ok(snapshot.apps.values().cloned().collect())
    }
}

fn file_mtime(path: &Path) -> Result<SystemTime, AuthError> {
    let metadata = std::fs::metadata(path).map_err(|err| {
        AuthError::UpstreamUnavailable(format!("registry {}: {err}", path.display()))
    })?;
    metadata.modified().map_err(|err| {
        AuthError::UpstreamUnavailable(format!("registry {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_registry(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("apps.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    fn entry(app_id: &str, min_level: i32) -> String {
        format!(
            r#"{{"app_id":"{app_id}","name":"{app_id} app","client_secret_hash":"$2b$04$abcdefghijklmnopqrstuv","redirect_uri":"https://{app_id}.internal/cb","min_level":{min_level}}}"#
        )
    }

    #[test]
    fn open_fails_on_missing_file() {
        let err = AppRegistry::open("/nonexistent/apps.json").unwrap_err();
        assert!(matches!(err, AuthError::UpstreamUnavailable(_)));
    }

    #[test]
    fn open_fails_on_malformed_json() {
        let dir = std::env::temp_dir().join("portiko-registry-malformed");
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_registry(&dir, "{not json");
        assert!(AppRegistry::open(path).is_err());
    }

    #[test]
    fn lookup_and_defaults() {
        let dir = std::env::temp_dir().join("portiko-registry-lookup");
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_registry(&dir, &format!("[{}]", entry("chat_app", 2)));
        let registry = AppRegistry::open(path).unwrap();

        let app = registry.find("chat_app").unwrap().unwrap();
        assert_eq!(app.min_level, 2);
        assert!(app.allowed_depts.is_empty());

        assert!(registry.find("unknown").unwrap().is_none());
    }

    #[test]
    fn refresh_picks_up_new_mtime() {
        let dir = std::env::temp_dir().join("portiko-registry-refresh");
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_registry(&dir, &format!("[{}]", entry("chat_app", 1)));
        let registry = AppRegistry::open(&path).unwrap();
        assert!(registry.find("wiki_app").unwrap().is_none());

        // Rewrite with a forced mtime bump; same-second writes can share an
        // mtime on coarse filesystems.
        write_registry(&dir, &format!("[{},{}]", entry("chat_app", 1), entry("wiki_app", 3)));
        let bumped = SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::File::open(&path).unwrap();
        file.set_modified(bumped).unwrap();

        assert!(registry.find("wiki_app").unwrap().is_some());
    }

    #[test]
    fn verify_client_secret_rejects_wrong_secret() {
        let hash = bcrypt::hash("s3cret", 4).unwrap();
        let app = AppRegistration {
            app_id: "chat_app".into(),
            name: "Chat".into(),
            client_secret_hash: hash,
            redirect_uri: "https://chat.internal/cb".into(),
            allowed_depts: vec![],
            min_level: 0,
        };
        assert!(app.verify_client_secret("s3cret"));
        assert!(!app.verify_client_secret("wrong"));
        assert!(!AppRegistration {
            client_secret_hash: "not-a-hash".into(),
            ..app
        }
        .verify_client_secret("s3cret"));
    }
}
