//! Clinical metadata handed to the DICOM SEG generator.

use crate::events::SharedEventSink;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::io;
use std::path::{Path, PathBuf};

/// Merges `overlay` into `base`.
///
/// Objects merge key by key, recursively; any other overlay value replaces
/// the base value, so arrays are never concatenated.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Metadata document for `itkimage2segimage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentationMetadata(Map<String, Value>);

impl Default for SegmentationMetadata {
    fn default() -> Self {
        let defaults = json!({
            "ContentCreatorName": "SpineAISystem",
            "ClinicalTrialSeriesID": "SpineSegmentation",
            "ClinicalTrialTimePointID": "1",
            "SeriesDescription": "AI Spine Segmentation",
            "SeriesNumber": "1001",
            "InstanceNumber": "1",
            "segmentAttributes": [[]],
            "BodyPart": "SPINE",
            "SegmentLabel": "SpineSegmentation",
        });
        match defaults {
            Value::Object(map) => Self(map),
            _ => Self(Map::new()),
        }
    }
}

impl SegmentationMetadata {
    /// The default document with `overrides` merged over it.
    ///
    /// A non-object override replaces nothing and is ignored.
    #[must_use]
    pub fn with_overrides(overrides: &Value) -> Self {
        let mut metadata = Self::default();
        metadata.merge(overrides);
        metadata
    }

    /// Merges `overrides` into this document; overrides win.
    pub fn merge(&mut self, overrides: &Value) {
        if let Value::Object(overlay) = overrides {
            for (key, value) in overlay {
                match self.0.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        self.0.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    }

    /// Returns a top-level attribute.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The document as a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// Side-file path for an intended output: `<stem>_metadata.json` beside it.
#[must_use]
pub fn metadata_side_file_path(output_file: &Path) -> PathBuf {
    let stem = output_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output_file.with_file_name(format!("{stem}_metadata.json"))
}

/// A metadata file on disk that is removed when the guard is dropped.
///
/// Removal happens on every exit path, including unwinding. Failure to
/// remove is reported as `metadata.cleanup.warning` and otherwise ignored.
pub struct MetadataSideFile {
    path: PathBuf,
    sink: SharedEventSink,
}

impl std::fmt::Debug for MetadataSideFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataSideFile").field("path", &self.path).finish_non_exhaustive()
    }
}

impl MetadataSideFile {
    /// Writes `metadata` as pretty JSON to `path`.
    pub fn create(path: PathBuf, metadata: &SegmentationMetadata, sink: SharedEventSink) -> io::Result<Self> {
        let body = serde_json::to_vec_pretty(metadata)?;
        std::fs::write(&path, body)?;
        Ok(Self { path, sink })
    }

    /// Location of the side-file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MetadataSideFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => self.sink.try_emit(
                "metadata.cleanup.warning",
                Some(json!({
                    "path": self.path,
                    "error": err.to_string(),
                })),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{noop_sink, CollectingEventSink};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_defaults_are_complete() {
        let metadata = SegmentationMetadata::default();

        for key in [
            "ContentCreatorName",
            "ClinicalTrialSeriesID",
            "ClinicalTrialTimePointID",
            "SeriesDescription",
            "SeriesNumber",
            "InstanceNumber",
            "segmentAttributes",
            "BodyPart",
            "SegmentLabel",
        ] {
            assert!(metadata.get(key).is_some(), "missing {key}");
        }
        assert_eq!(metadata.get("BodyPart"), Some(&json!("SPINE")));
    }

    #[test]
    fn test_override_wins_and_nested_objects_merge() {
        let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}, "list": [1, 2]});
        deep_merge(&mut base, &json!({"a": 2, "nested": {"y": 3, "z": 4}, "list": [9]}));

        assert_eq!(base, json!({"a": 2, "nested": {"x": 1, "y": 3, "z": 4}, "list": [9]}));
    }

    #[test]
    fn test_with_overrides() {
        let metadata = SegmentationMetadata::with_overrides(&json!({
            "SeriesDescription": "Research Segmentation",
            "SeriesNumber": "2001",
        }));

        assert_eq!(metadata.get("SeriesDescription"), Some(&json!("Research Segmentation")));
        assert_eq!(metadata.get("SeriesNumber"), Some(&json!("2001")));
        assert_eq!(metadata.get("ContentCreatorName"), Some(&json!("SpineAISystem")));

        let ignored = SegmentationMetadata::with_overrides(&json!("not an object"));
        assert_eq!(ignored, SegmentationMetadata::default());
    }

    #[test]
    fn test_side_file_path() {
        assert_eq!(
            metadata_side_file_path(Path::new("/out/study_seg.dcm")),
            PathBuf::from("/out/study_seg_metadata.json")
        );
    }

    #[test]
    fn test_side_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg_metadata.json");

        let guard = MetadataSideFile::create(path.clone(), &SegmentationMetadata::default(), noop_sink()).unwrap();
        let written: Value = serde_json::from_slice(&std::fs::read(guard.path()).unwrap()).unwrap();
        assert_eq!(written["SeriesNumber"], json!("1001"));

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_side_file_already_gone_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg_metadata.json");
        let sink = Arc::new(CollectingEventSink::new());

        let guard = MetadataSideFile::create(path.clone(), &SegmentationMetadata::default(), sink.clone()).unwrap();
        std::fs::remove_file(&path).unwrap();
        drop(guard);

        assert!(sink.is_empty());
    }

    #[test]
    fn test_side_file_removed_during_unwind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg_metadata.json");
        let inner = path.clone();

        let outcome = std::panic::catch_unwind(move || {
            let _guard = MetadataSideFile::create(inner, &SegmentationMetadata::default(), noop_sink()).unwrap();
            panic!("tool adapter panicked");
        });

        assert!(outcome.is_err());
        assert!(!path.exists());
    }
}
