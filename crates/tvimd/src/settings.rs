//! Per-user persistent settings: parental controls, blocked ratings,
//! hidden inputs and custom input labels.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use tvim_core::{ContentRating, InputId, UserId};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to write settings {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode settings: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Settings of one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub parental_controls_enabled: bool,
    #[serde(default)]
    pub blocked_ratings: Vec<ContentRating>,
    #[serde(default)]
    pub hidden_inputs: BTreeSet<InputId>,
    #[serde(default)]
    pub custom_labels: BTreeMap<InputId, String>,
}

/// Settings collaborator of the broker. Every call is scoped to a user.
pub trait SettingsStore: Send + Sync {
    fn is_parental_controls_enabled(&self, user: UserId) -> bool;

    fn set_parental_controls_enabled(&self, user: UserId, enabled: bool)
        -> Result<(), SettingsError>;

    /// True if some blocked rating contains `rating`.
    fn is_rating_blocked(&self, user: UserId, rating: &ContentRating) -> bool;

    fn blocked_ratings(&self, user: UserId) -> Vec<ContentRating>;

    fn add_blocked_rating(&self, user: UserId, rating: ContentRating) -> Result<(), SettingsError>;

    fn remove_blocked_rating(&self, user: UserId, rating: &ContentRating)
        -> Result<(), SettingsError>;

    fn hidden_inputs(&self, user: UserId) -> BTreeSet<InputId>;

    fn set_input_hidden(&self, user: UserId, input: &InputId, hidden: bool)
        -> Result<(), SettingsError>;

    fn custom_labels(&self, user: UserId) -> BTreeMap<InputId, String>;

    fn set_custom_label(&self, user: UserId, input: &InputId, label: Option<String>)
        -> Result<(), SettingsError>;
}

/// Settings kept as one JSON document per user.
///
/// Documents are loaded lazily and rewritten (via a temp file and rename)
/// after each mutation. Without a directory the store lives in memory only.
pub struct FileSettingsStore {
    dir: Option<PathBuf>,
    users: RwLock<HashMap<UserId, UserSettings>>,
}

impl FileSettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            dir: None,
            users: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(dir: &Path, user: UserId) -> PathBuf {
        dir.join(format!("settings-{user}.json"))
    }

    fn load(&self, user: UserId) -> UserSettings {
        let Some(dir) = &self.dir else {
            return UserSettings::default();
        };
        let path = Self::path_for(dir, user);
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Corrupt settings, using defaults");
                UserSettings::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => UserSettings::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable settings, using defaults");
                UserSettings::default()
            }
        }
    }

    fn read<R>(&self, user: UserId, f: impl FnOnce(&UserSettings) -> R) -> R {
        if let Some(settings) = self.users.read().get(&user) {
            return f(settings);
        }
        let loaded = self.load(user);
        let mut users = self.users.write();
        f(users.entry(user).or_insert(loaded))
    }

    fn update(
        &self,
        user: UserId,
        f: impl FnOnce(&mut UserSettings) -> bool,
    ) -> Result<(), SettingsError> {
        let loaded = if self.users.read().contains_key(&user) {
            None
        } else {
            Some(self.load(user))
        };

        let mut users = self.users.write();
        let settings = users
            .entry(user)
            .or_insert_with(|| loaded.unwrap_or_default());
        if !f(settings) {
            return Ok(());
        }
        let snapshot = settings.clone();
        drop(users);
        self.persist(user, &snapshot)
    }

    fn persist(&self, user: UserId, settings: &UserSettings) -> Result<(), SettingsError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = Self::path_for(dir, user);
        let body = serde_json::to_vec_pretty(settings)?;
        let write_err = |source| SettingsError::Write {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(write_err)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(write_err)?;
        std::fs::rename(&tmp, &path).map_err(write_err)?;
        debug!(user = %user, path = %path.display(), "Settings persisted");
        Ok(())
    }
}

impl SettingsStore for FileSettingsStore {
    fn is_parental_controls_enabled(&self, user: UserId) -> bool {
        self.read(user, |s| s.parental_controls_enabled)
    }

    fn set_parental_controls_enabled(
        &self,
        user: UserId,
        enabled: bool,
    ) -> Result<(), SettingsError> {
        self.update(user, |s| {
            let changed = s.parental_controls_enabled != enabled;
            s.parental_controls_enabled = enabled;
            changed
        })
    }

    fn is_rating_blocked(&self, user: UserId, rating: &ContentRating) -> bool {
        self.read(user, |s| {
            s.blocked_ratings.iter().any(|blocked| blocked.contains(rating))
        })
    }

    fn blocked_ratings(&self, user: UserId) -> Vec<ContentRating> {
        self.read(user, |s| s.blocked_ratings.clone())
    }

    fn add_blocked_rating(&self, user: UserId, rating: ContentRating) -> Result<(), SettingsError> {
        self.update(user, |s| {
            if s.blocked_ratings.contains(&rating) {
                return false;
            }
            s.blocked_ratings.push(rating);
            true
        })
    }

    fn remove_blocked_rating(
        &self,
        user: UserId,
        rating: &ContentRating,
    ) -> Result<(), SettingsError> {
        self.update(user, |s| {
            let before = s.blocked_ratings.len();
            s.blocked_ratings.retain(|r| r != rating);
            s.blocked_ratings.len() != before
        })
    }

    fn hidden_inputs(&self, user: UserId) -> BTreeSet<InputId> {
        self.read(user, |s| s.hidden_inputs.clone())
    }

    fn set_input_hidden(
        &self,
        user: UserId,
        input: &InputId,
        hidden: bool,
    ) -> Result<(), SettingsError> {
        self.update(user, |s| {
            if hidden {
                s.hidden_inputs.insert(input.clone())
            } else {
                s.hidden_inputs.remove(input)
            }
        })
    }

    fn custom_labels(&self, user: UserId) -> BTreeMap<InputId, String> {
        self.read(user, |s| s.custom_labels.clone())
    }

    fn set_custom_label(
        &self,
        user: UserId,
        input: &InputId,
        label: Option<String>,
    ) -> Result<(), SettingsError> {
        self.update(user, |s| match label {
            Some(label) => s.custom_labels.insert(input.clone(), label.clone()) != Some(label),
            None => s.custom_labels.remove(input).is_some(),
        })
    }
}
