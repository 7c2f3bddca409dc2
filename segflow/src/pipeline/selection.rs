//! Choice of the segmentation volume handed to the structured-output stage.

use crate::adapters::volume::{is_volume_name, volume_stem};
use crate::core::StageName;
use crate::errors::StageError;
use std::path::{Path, PathBuf};

/// The chosen segmentation volume and, when the choice was not unique, why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Volume passed to the structured-output stage.
    pub path: PathBuf,
    /// Set when several segmented series matched a converted series.
    pub warning: Option<String>,
}

fn join_names<P: AsRef<Path>>(paths: &[P]) -> String {
    paths
        .iter()
        .map(|p| p.as_ref().display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Orders converted volumes the way the converter announced them.
///
/// Volumes found on disk but never reported keep their listing order and
/// go last.
#[must_use]
pub fn conversion_order(reported: &[PathBuf], on_disk: &[PathBuf]) -> Vec<PathBuf> {
    let mut ordered: Vec<PathBuf> = Vec::with_capacity(on_disk.len());
    for stem in reported.iter().filter_map(|p| volume_stem(p)) {
        if let Some(found) = on_disk.iter().find(|p| volume_stem(p) == Some(stem)) {
            if !ordered.contains(found) {
                ordered.push(found.clone());
            }
        }
    }
    for path in on_disk {
        if !ordered.contains(path) {
            ordered.push(path.clone());
        }
    }
    ordered
}

/// Picks the segmentation volume that corresponds to the source series.
///
/// Candidates are the volumetric files among `candidates`. The candidate
/// matching the earliest entry of `converted` by stem wins; if later
/// entries match too, the choice carries a warning naming the others.
/// Without any match a sole candidate is accepted. Anything else is
/// ambiguous and rejected as invalid input to the structured-output stage.
pub fn select_segmentation_file(candidates: &[PathBuf], converted: &[PathBuf]) -> Result<Selection, StageError> {
    let volumes: Vec<&PathBuf> = candidates.iter().filter(|p| is_volume_name(p)).collect();

    let mut matched: Vec<&PathBuf> = Vec::new();
    for stem in converted.iter().filter_map(|p| volume_stem(p)) {
        if let Some(found) = volumes.iter().find(|c| volume_stem(c) == Some(stem)) {
            if !matched.contains(found) {
                matched.push(*found);
            }
        }
    }

    if let Some((first, others)) = matched.split_first() {
        let warning = (!others.is_empty()).then(|| {
            format!(
                "{} segmented series match converted series; using {} and ignoring {}",
                matched.len(),
                first.display(),
                join_names(others)
            )
        });
        return Ok(Selection {
            path: (*first).clone(),
            warning,
        });
    }

    match volumes.as_slice() {
        [only] => Ok(Selection {
            path: (*only).clone(),
            warning: None,
        }),
        [] => Err(StageError::input_invalid(
            StageName::StructuredOutput,
            "No segmentation volume available",
        )),
        many => Err(StageError::input_invalid(
            StageName::StructuredOutput,
            format!(
                "Cannot choose a segmentation volume; none matches a converted series. Candidates: {}",
                join_names(many)
            ),
        )),
    }
}
