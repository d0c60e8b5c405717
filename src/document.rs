//! Persisted findings document.
//!
//! Findings are merged into a YAML document shared with other subsystems:
//!
//! ```yaml
//! discovered_items:
//!   spa-1:
//!     lights:
//!       - id: zone_1
//!         detected_modes: [OFF, ON, WHITE]
//!         calibration: {gain: 3}   # owned by someone else, preserved
//!     pumps: [...]                 # preserved
//! ```
//!
//! Only the detected-mode list of zone entries touched by a run is replaced;
//! every other key, and the order of keys, is left as found.

use crate::error::DocumentError;
use crate::state::{DeviceFindings, Results, SupportedMode, ZoneFindings};
use crate::types::DeviceId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Storage backend for the persisted document
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read the document; `Ok(None)` if it does not exist
    async fn read_document(&self, path: &Path) -> Result<Option<Value>, DocumentError>;

    /// Replace the document
    async fn write_document(&self, path: &Path, document: &Value) -> Result<(), DocumentError>;
}

/// [`DocumentStore`] backed by a YAML file
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlDocumentStore;

#[async_trait]
impl DocumentStore for YamlDocumentStore {
    async fn read_document(&self, path: &Path) -> Result<Option<Value>, DocumentError> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_yaml::from_str::<Value>(&text)? {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }

    async fn write_document(&self, path: &Path, document: &Value) -> Result<(), DocumentError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let text = serde_yaml::to_string(document)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Key names used in the persisted document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLayout {
    /// Top-level key holding the per-device entries
    #[serde(default = "default_root_key")]
    pub root_key: String,

    /// Per-device key holding the list of zone entries
    #[serde(default = "default_zones_key")]
    pub zones_key: String,

    /// Per-zone key holding the detected mode names
    #[serde(default = "default_modes_key")]
    pub modes_key: String,

    /// Per-zone key holding the zone id
    #[serde(default = "default_id_key")]
    pub id_key: String,
}

fn default_root_key() -> String {
    "discovered_items".to_string()
}

fn default_zones_key() -> String {
    "lights".to_string()
}

fn default_modes_key() -> String {
    "detected_modes".to_string()
}

fn default_id_key() -> String {
    "id".to_string()
}

impl Default for DocumentLayout {
    fn default() -> Self {
        Self {
            root_key: default_root_key(),
            zones_key: default_zones_key(),
            modes_key: default_modes_key(),
            id_key: default_id_key(),
        }
    }
}

/// Merge findings into an existing document
///
/// A missing document, or one whose structure is not a mapping where one is
/// expected, is replaced by an empty one at that level.
pub fn merge_findings(existing: Option<Value>, results: &Results, layout: &DocumentLayout) -> Value {
    let mut document = match existing {
        Some(Value::Mapping(map)) => map,
        Some(other) => {
            tracing::warn!("Persisted document is a {}, not a mapping; starting empty", kind(&other));
            Mapping::new()
        }
        None => Mapping::new(),
    };

    let mut devices = take_mapping(&mut document, &layout.root_key);
    for (device_id, findings) in &results.devices {
        let mut device = take_mapping(&mut devices, device_id);
        let mut zones = take_sequence(&mut device, &layout.zones_key);
        for zone in &findings.zones {
            merge_zone(&mut zones, zone, layout);
        }
        device.insert(Value::String(layout.zones_key.clone()), Value::Sequence(zones));
        devices.insert(Value::String(device_id.clone()), Value::Mapping(device));
    }
    document.insert(Value::String(layout.root_key.clone()), Value::Mapping(devices));

    Value::Mapping(document)
}

fn merge_zone(zones: &mut Vec<Value>, zone: &ZoneFindings, layout: &DocumentLayout) {
    let modes = Value::Sequence(
        zone.detected_modes()
            .into_iter()
            .map(Value::String)
            .collect(),
    );

    let existing = zones.iter_mut().find_map(|entry| match entry {
        Value::Mapping(map)
            if map.get(layout.id_key.as_str()).and_then(Value::as_str) == Some(zone.zone_id.as_str()) =>
        {
            Some(map)
        }
        _ => None,
    });

    match existing {
        Some(map) => {
            map.insert(Value::String(layout.modes_key.clone()), modes);
        }
        None => {
            let mut map = Mapping::new();
            map.insert(
                Value::String(layout.id_key.clone()),
                Value::String(zone.zone_id.clone()),
            );
            map.insert(Value::String(layout.modes_key.clone()), modes);
            zones.push(Value::Mapping(map));
        }
    }
}

// The taken entry is left as null until the caller inserts it back, which
// keeps its position in the mapping.
fn take_mapping(parent: &mut Mapping, key: &str) -> Mapping {
    match parent.get_mut(key).map(std::mem::take) {
        Some(Value::Mapping(map)) => map,
        Some(other) => {
            tracing::warn!("Replacing {} entry '{}' in persisted document", kind(&other), key);
            Mapping::new()
        }
        None => Mapping::new(),
    }
}

fn take_sequence(parent: &mut Mapping, key: &str) -> Vec<Value> {
    match parent.get_mut(key).map(std::mem::take) {
        Some(Value::Sequence(seq)) => seq,
        Some(other) => {
            tracing::warn!("Replacing {} entry '{}' in persisted document", kind(&other), key);
            Vec::new()
        }
        None => Vec::new(),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged",
    }
}

/// Extract previously detected modes from a document
pub fn findings_from_document(
    document: &Value,
    layout: &DocumentLayout,
) -> Result<BTreeMap<DeviceId, DeviceFindings>, DocumentError> {
    let root = document
        .as_mapping()
        .ok_or_else(|| DocumentError::Malformed(format!("document is a {}", kind(document))))?;

    let Some(devices) = root.get(layout.root_key.as_str()) else {
        return Ok(BTreeMap::new());
    };
    let devices = devices.as_mapping().ok_or_else(|| {
        DocumentError::Malformed(format!("'{}' is not a mapping", layout.root_key))
    })?;

    let mut out = BTreeMap::new();
    for (device_id, device) in devices {
        let Some(device_id) = device_id.as_str() else {
            tracing::warn!("Skipping device entry with non-string key");
            continue;
        };
        let zones = device
            .get(layout.zones_key.as_str())
            .and_then(Value::as_sequence)
            .map(|zones| {
                zones
                    .iter()
                    .filter_map(|zone| zone_from_entry(zone, layout))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        out.insert(device_id.to_string(), DeviceFindings { zones });
    }
    Ok(out)
}

fn zone_from_entry(entry: &Value, layout: &DocumentLayout) -> Option<ZoneFindings> {
    let zone_id = entry.get(layout.id_key.as_str())?.as_str()?;
    let mut findings = ZoneFindings::new(zone_id);
    findings.zone_index = zone_id
        .strip_prefix("zone_")
        .and_then(|n| n.parse().ok());
    findings.supported_modes = entry
        .get(layout.modes_key.as_str())
        .and_then(Value::as_sequence)
        .map(|modes| {
            modes
                .iter()
                .filter_map(Value::as_str)
                .map(SupportedMode::new)
                .collect()
        })
        .unwrap_or_default();
    Some(findings)
}

/// The findings document at one path, accessed through a [`DocumentStore`]
#[derive(Clone)]
pub struct FindingsDocument {
    store: Arc<dyn DocumentStore>,
    path: PathBuf,
    layout: DocumentLayout,
}

impl FindingsDocument {
    pub fn new(store: Arc<dyn DocumentStore>, path: impl Into<PathBuf>, layout: DocumentLayout) -> Self {
        Self {
            store,
            path: path.into(),
            layout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read-merge-write the results into the document
    ///
    /// An unreadable existing document is treated as empty.
    pub async fn persist(&self, results: &Results) -> Result<PathBuf, DocumentError> {
        let existing = match self.store.read_document(&self.path).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::warn!(
                    "Could not read {}, treating it as empty: {}",
                    self.path.display(),
                    e
                );
                None
            }
        };

        let merged = merge_findings(existing, results, &self.layout);
        self.store.write_document(&self.path, &merged).await?;

        tracing::info!(
            "Saved {} zones to {}",
            results.total_zones_probed,
            self.path.display()
        );
        Ok(self.path.clone())
    }

    /// Load previously persisted findings; a missing document yields none
    pub async fn load(&self) -> Result<BTreeMap<DeviceId, DeviceFindings>, DocumentError> {
        match self.store.read_document(&self.path).await? {
            Some(document) => findings_from_document(&document, &self.layout),
            None => {
                tracing::info!("No persisted findings at {}", self.path.display());
                Ok(BTreeMap::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXISTING: &str = "\
discovered_items:
  spa-1:
    name: Backyard
    lights:
    - id: zone_1
      calibration:
        gain: 3
      detected_modes:
      - OFF
    - id: zone_9
      detected_modes:
      - RED
    pumps:
    - id: P1
other_subsystem:
  keep: true
";

    fn results(modes: &[&str]) -> Results {
        let mut zone = ZoneFindings::new("zone_1");
        zone.supported_modes = modes.iter().map(|m| SupportedMode::new(*m)).collect();
        let mut devices = BTreeMap::new();
        devices.insert("spa-1".to_string(), DeviceFindings { zones: vec![zone] });
        Results::new(devices, None)
    }

    #[test]
    fn merge_replaces_only_detected_modes() {
        let existing: Value = serde_yaml::from_str(EXISTING).unwrap();
        let merged = merge_findings(Some(existing), &results(&["OFF", "ON"]), &DocumentLayout::default());
        let text = serde_yaml::to_string(&merged).unwrap();

        let expected = EXISTING.replace(
            "      - OFF\n    - id: zone_9",
            "      - OFF\n      - ON\n    - id: zone_9",
        );
        let expected: Value = serde_yaml::from_str(&expected).unwrap();
        assert_eq!(text, serde_yaml::to_string(&expected).unwrap());
    }

    #[test]
    fn merge_is_idempotent() {
        let layout = DocumentLayout::default();
        let existing: Value = serde_yaml::from_str(EXISTING).unwrap();
        let once = merge_findings(Some(existing), &results(&["OFF", "WHITE"]), &layout);
        let twice = merge_findings(Some(once.clone()), &results(&["OFF", "WHITE"]), &layout);
        assert_eq!(
            serde_yaml::to_string(&once).unwrap(),
            serde_yaml::to_string(&twice).unwrap()
        );
    }

    #[test]
    fn merge_creates_missing_entries() {
        let merged = merge_findings(None, &results(&["ON"]), &DocumentLayout::default());
        let zone = &merged["discovered_items"]["spa-1"]["lights"][0];
        assert_eq!(zone["id"].as_str(), Some("zone_1"));
        assert_eq!(zone["detected_modes"][0].as_str(), Some("ON"));
    }

    #[test]
    fn merge_replaces_misshapen_entries_in_place() {
        let existing: Value = serde_yaml::from_str(
            "first: 1\ndiscovered_items:\n  spa-1:\n    lights: broken\n    name: Backyard\n  spa-2: 7\nlast: 2\n",
        )
        .unwrap();
        let merged = merge_findings(Some(existing), &results(&["ON"]), &DocumentLayout::default());

        let keys: Vec<&str> = merged
            .as_mapping()
            .unwrap()
            .keys()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(keys, vec!["first", "discovered_items", "last"]);

        let device = &merged["discovered_items"]["spa-1"];
        assert_eq!(device["lights"][0]["detected_modes"][0].as_str(), Some("ON"));
        assert_eq!(device["name"].as_str(), Some("Backyard"));
        assert_eq!(merged["discovered_items"]["spa-2"].as_u64(), Some(7));
    }

    #[test]
    fn findings_are_read_back() {
        let document: Value = serde_yaml::from_str(EXISTING).unwrap();
        let devices = findings_from_document(&document, &DocumentLayout::default()).unwrap();
        let zones = &devices["spa-1"].zones;
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].detected_modes(), vec!["OFF"]);
        assert_eq!(zones[1].zone_index, Some(9));
    }

    #[test]
    fn non_mapping_document_is_malformed() {
        let document = Value::Sequence(vec![]);
        assert!(matches!(
            findings_from_document(&document, &DocumentLayout::default()),
            Err(DocumentError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn yaml_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("discovered_items.yaml");
        let store = YamlDocumentStore;

        assert!(store.read_document(&path).await.unwrap().is_none());

        let document: Value = serde_yaml::from_str(EXISTING).unwrap();
        store.write_document(&path, &document).await.unwrap();
        assert_eq!(store.read_document(&path).await.unwrap(), Some(document));
    }

    #[tokio::test]
    async fn persist_overwrites_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("discovered_items.yaml");
        tokio::fs::write(&path, "lights: [unclosed").await.unwrap();

        let document = FindingsDocument::new(Arc::new(YamlDocumentStore), &path, DocumentLayout::default());
        document.persist(&results(&["OFF"])).await.unwrap();

        let loaded = document.load().await.unwrap();
        assert_eq!(loaded["spa-1"].zones[0].detected_modes(), vec!["OFF"]);
    }
}
