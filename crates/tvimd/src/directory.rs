//! Provider directory - enumerates installed providers.
//!
//! Providers are described by TOML manifests in one directory:
//!
//! ```toml
//! package = "com.example.tuner"
//! class = "com.example.tuner.TunerService"
//! permission = "tvim.permission.BIND_TV_INPUT"
//! hardware = false
//! runtime = "loopback"
//!
//! [input]
//! type = "tuner"
//! setup_activity = "com.example.tuner.SetupActivity"
//! label = "Antenna"
//! ```
//!
//! # Async Safety
//!
//! The broker reads the directory while handling a command, so lookups
//! are served from an in-memory snapshot. Filesystem scans run via
//! `spawn_blocking` in [`ManifestDirectory::rescan`].
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Unreadable or malformed manifests are logged and skipped

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use tvim_core::{ComponentName, InputDescriptor, InputId, InputType, UserId};

/// Permission a provider must require of its binders to be listed.
pub const BIND_PERMISSION: &str = "tvim.permission.BIND_TV_INPUT";

/// Manifest file extension.
const MANIFEST_EXTENSION: &str = "toml";

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while reading provider metadata.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest {path}: {message}")]
    InvalidManifest { path: PathBuf, message: String },

    /// The provider declares no input metadata
    #[error("provider {0} has no input metadata")]
    MissingMetadata(ComponentName),

    #[error("invalid input for {component}: {message}")]
    InvalidInput {
        component: ComponentName,
        message: String,
    },

    #[error("directory scan task failed: {0}")]
    TaskFailed(String),
}

// ============================================================================
// Provider Entries
// ============================================================================

/// Input metadata declared by a non-hardware provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InputMetadata {
    #[serde(rename = "type", default)]
    pub input_type: InputType,
    #[serde(default)]
    pub setup_activity: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

/// One installed provider as reported by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEntry {
    pub component: ComponentName,
    /// Permission the provider requires of callers binding to it.
    pub permission: Option<String>,
    /// The provider may manage hardware pass-through devices.
    pub is_hardware: bool,
    /// How the daemon runs this provider (e.g. `loopback`).
    pub runtime: String,
    pub metadata: Option<InputMetadata>,
}

impl ProviderEntry {
    pub fn requires_bind_permission(&self) -> bool {
        self.permission.as_deref() == Some(BIND_PERMISSION)
    }
}

// ============================================================================
// Directory Trait
// ============================================================================

/// Source of installed providers.
pub trait Directory: Send + Sync {
    /// Providers visible to `user`.
    fn enumerate_providers(&self, user: UserId) -> Vec<ProviderEntry>;

    /// Builds the input descriptor of a non-hardware provider.
    ///
    /// A tuner input without a setup activity fails to load.
    fn load_descriptor(&self, entry: &ProviderEntry) -> Result<InputDescriptor, DirectoryError> {
        let metadata = entry
            .metadata
            .as_ref()
            .ok_or_else(|| DirectoryError::MissingMetadata(entry.component.clone()))?;

        let mut descriptor = InputDescriptor::new(
            InputId::for_component(&entry.component),
            entry.component.clone(),
            metadata.input_type,
        );
        descriptor.setup_activity = metadata.setup_activity.clone();
        descriptor.label = metadata.label.clone();
        descriptor.parent_id = metadata.parent.clone().map(InputId::from);

        descriptor
            .validate()
            .map_err(|e| DirectoryError::InvalidInput {
                component: entry.component.clone(),
                message: e.to_string(),
            })?;
        Ok(descriptor)
    }
}

// ============================================================================
// Manifest Directory
// ============================================================================

#[derive(Debug, Deserialize)]
struct Manifest {
    package: String,
    class: String,
    #[serde(default)]
    permission: Option<String>,
    #[serde(default)]
    hardware: bool,
    #[serde(default = "default_runtime")]
    runtime: String,
    #[serde(default)]
    input: Option<InputMetadata>,
}

fn default_runtime() -> String {
    "loopback".to_string()
}

/// Packages whose manifests changed between two scans.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub providers: usize,
    /// Packages present in both scans whose entries differ.
    pub updated_packages: Vec<String>,
    /// Packages that appeared or disappeared.
    pub changed_packages: Vec<String>,
}

/// Directory backed by a folder of TOML manifests.
///
/// The same provider set is visible to every user.
pub struct ManifestDirectory {
    root: PathBuf,
    entries: RwLock<Vec<ProviderEntry>>,
}

impl ManifestDirectory {
    /// Creates an empty directory; call [`rescan`](Self::rescan) to load it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Re-reads every manifest and swaps the snapshot.
    pub async fn rescan(&self) -> Result<ScanResult, DirectoryError> {
        let root = self.root.clone();
        let scanned = tokio::task::spawn_blocking(move || scan_manifests(&root))
            .await
            .map_err(|e| DirectoryError::TaskFailed(e.to_string()))??;

        let result = {
            let mut entries = self.entries.write();
            let result = diff_entries(&entries, &scanned);
            *entries = scanned;
            result
        };

        info!(
            root = %self.root.display(),
            providers = result.providers,
            updated = result.updated_packages.len(),
            changed = result.changed_packages.len(),
            "Provider manifests scanned"
        );
        Ok(result)
    }
}

impl Directory for ManifestDirectory {
    fn enumerate_providers(&self, _user: UserId) -> Vec<ProviderEntry> {
        self.entries.read().clone()
    }
}

/// Reads every `*.toml` file under `root`.
///
/// This function performs blocking I/O and should be called via `spawn_blocking`.
fn scan_manifests(root: &Path) -> Result<Vec<ProviderEntry>, DirectoryError> {
    if !root.exists() {
        debug!(root = %root.display(), "Provider directory does not exist");
        return Ok(Vec::new());
    }

    let read_dir = std::fs::read_dir(root).map_err(|source| DirectoryError::Io {
        path: root.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = read_dir
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(MANIFEST_EXTENSION))
        .collect();
    paths.sort();

    let mut entries = Vec::with_capacity(paths.len());
    for path in paths {
        match parse_manifest(&path) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(error = %e, "Skipping provider manifest"),
        }
    }
    Ok(entries)
}

fn parse_manifest(path: &Path) -> Result<ProviderEntry, DirectoryError> {
    let raw = std::fs::read_to_string(path).map_err(|source| DirectoryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let manifest: Manifest = toml::from_str(&raw).map_err(|e| DirectoryError::InvalidManifest {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(ProviderEntry {
        component: ComponentName::new(manifest.package, manifest.class),
        permission: manifest.permission,
        is_hardware: manifest.hardware,
        runtime: manifest.runtime,
        metadata: manifest.input,
    })
}

fn diff_entries(old: &[ProviderEntry], new: &[ProviderEntry]) -> ScanResult {
    let by_package = |entries: &[ProviderEntry]| -> BTreeMap<String, Vec<ProviderEntry>> {
        let mut map: BTreeMap<String, Vec<ProviderEntry>> = BTreeMap::new();
        for entry in entries {
            map.entry(entry.component.package.clone())
                .or_default()
                .push(entry.clone());
        }
        map
    };
    let old_map = by_package(old);
    let new_map = by_package(new);

    let mut updated_packages = Vec::new();
    let mut changed = BTreeSet::new();
    for (package, entries) in &new_map {
        match old_map.get(package) {
            Some(previous) if previous != entries => updated_packages.push(package.clone()),
            Some(_) => {}
            None => {
                changed.insert(package.clone());
            }
        }
    }
    for package in old_map.keys() {
        if !new_map.contains_key(package) {
            changed.insert(package.clone());
        }
    }

    ScanResult {
        providers: new.len(),
        updated_packages,
        changed_packages: changed.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TUNER: &str = r#"
package = "com.example.tuner"
class = "com.example.tuner.TunerService"
permission = "tvim.permission.BIND_TV_INPUT"

[input]
type = "tuner"
setup_activity = "com.example.tuner.Setup"
label = "Antenna"
"#;

    const HDMI_HW: &str = r#"
package = "com.example.hw"
class = "com.example.hw.HardwareService"
permission = "tvim.permission.BIND_TV_INPUT"
hardware = true
"#;

    struct Fixed(Vec<ProviderEntry>);

    impl Directory for Fixed {
        fn enumerate_providers(&self, _user: UserId) -> Vec<ProviderEntry> {
            self.0.clone()
        }
    }

    fn write(dir: &TempDir, name: &str, body: &str) {
        std::fs::write(dir.path().join(name), body).unwrap();
    }

    #[tokio::test]
    async fn test_rescan_reads_manifests() {
        let dir = TempDir::new().unwrap();
        write(&dir, "tuner.toml", TUNER);
        write(&dir, "hw.toml", HDMI_HW);
        write(&dir, "notes.txt", "ignored");
        write(&dir, "broken.toml", "package = ");

        let directory = ManifestDirectory::new(dir.path());
        let result = directory.rescan().await.unwrap();
        assert_eq!(result.providers, 2);

        let entries = directory.enumerate_providers(UserId::SYSTEM);
        let hw = entries.iter().find(|e| e.is_hardware).unwrap();
        assert_eq!(hw.component.package, "com.example.hw");
        assert!(hw.requires_bind_permission());
        assert_eq!(hw.runtime, "loopback");
    }

    #[tokio::test]
    async fn test_rescan_reports_updated_packages() {
        let dir = TempDir::new().unwrap();
        write(&dir, "tuner.toml", TUNER);
        let directory = ManifestDirectory::new(dir.path());
        directory.rescan().await.unwrap();

        write(&dir, "tuner.toml", &TUNER.replace("Antenna", "Cable"));
        write(&dir, "hw.toml", HDMI_HW);
        let result = directory.rescan().await.unwrap();
        assert_eq!(result.updated_packages, vec!["com.example.tuner".to_string()]);
        assert_eq!(result.changed_packages, vec!["com.example.hw".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let directory = ManifestDirectory::new("/nonexistent/tvim/providers");
        let result = directory.rescan().await.unwrap();
        assert_eq!(result.providers, 0);
    }

    #[test]
    fn test_load_descriptor() {
        let entry = parse_manifest_str(TUNER);
        let directory = Fixed(vec![entry.clone()]);
        let descriptor = directory.load_descriptor(&entry).unwrap();
        assert_eq!(descriptor.id.as_str(), "com.example.tuner/.TunerService");
        assert_eq!(descriptor.label.as_deref(), Some("Antenna"));
        assert!(!descriptor.is_passthrough());
    }

    #[test]
    fn test_tuner_without_setup_activity_fails() {
        let entry = parse_manifest_str(&TUNER.replace(
            "setup_activity = \"com.example.tuner.Setup\"\n",
            "",
        ));
        let directory = Fixed(vec![]);
        assert!(matches!(
            directory.load_descriptor(&entry),
            Err(DirectoryError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_missing_metadata_fails() {
        let entry = parse_manifest_str(HDMI_HW);
        assert!(matches!(
            Fixed(vec![]).load_descriptor(&entry),
            Err(DirectoryError::MissingMetadata(_))
        ));
    }

    fn parse_manifest_str(body: &str) -> ProviderEntry {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.toml");
        std::fs::write(&path, body).unwrap();
        parse_manifest(&path).unwrap()
    }
}
