//! Class-index-to-name mapping for trained detector models
//!
//! Names come from (in order of preference) a dataset YAML file, the
//! `names` entry that Ultralytics writes into exported ONNX metadata, or
//! generated `class_<id>` placeholders.

use crate::ObjectDetectionError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Largest class id accepted in a names mapping
pub const MAX_CLASS_ID: u32 = 10_000;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NamesField {
    List(Vec<String>),
    Map(BTreeMap<u32, String>),
}

#[derive(Debug, Deserialize)]
struct DatasetYaml {
    names: NamesField,
}

/// Load class names from a dataset YAML file (`names:` as a list or id map)
pub fn load_class_names_yaml(path: impl AsRef<Path>) -> Result<Vec<String>, ObjectDetectionError> {
    let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        ObjectDetectionError::ClassNames(format!(
            "Failed to read {}: {e}",
            path.as_ref().display()
        ))
    })?;
    parse_class_names_yaml(&contents)
}

/// Parse class names from dataset YAML text
pub fn parse_class_names_yaml(contents: &str) -> Result<Vec<String>, ObjectDetectionError> {
    let dataset: DatasetYaml = serde_yaml::from_str(contents)
        .map_err(|e| ObjectDetectionError::ClassNames(format!("Failed to parse YAML: {e}")))?;

    match dataset.names {
        NamesField::List(names) => Ok(names),
        NamesField::Map(map) => dense_names(map),
    }
}

/// Parse the Ultralytics metadata form: `{0: 'crack', 1: 'erosion'}`
///
/// The value is a YAML flow mapping from class id to name.
pub fn parse_metadata_names(raw: &str) -> Result<Vec<String>, ObjectDetectionError> {
    let map: BTreeMap<u32, String> = serde_yaml::from_str(raw).map_err(|e| {
        ObjectDetectionError::ClassNames(format!("Not a names map '{raw}': {e}"))
    })?;
    dense_names(map)
}

/// Placeholder names for models without a mapping
#[must_use]
pub fn placeholder_names(num_classes: usize) -> Vec<String> {
    (0..num_classes).map(|id| format!("class_{id}")).collect()
}

/// Expand a sparse id map into a dense list, filling gaps with placeholders
fn dense_names(map: BTreeMap<u32, String>) -> Result<Vec<String>, ObjectDetectionError> {
    let len = match map.keys().next_back() {
        None => 0,
        Some(&max) if max > MAX_CLASS_ID => {
            return Err(ObjectDetectionError::ClassNames(format!(
                "Class id {max} exceeds the limit of {MAX_CLASS_ID}"
            )))
        }
        Some(&max) => max as usize + 1,
    };
    let mut names = placeholder_names(len);
    for (id, name) in map {
        names[id as usize] = name;
    }
    Ok(names)
}
