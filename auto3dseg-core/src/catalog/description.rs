//! `Models.json` parsing.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::warn;

/// `<path>/<filename>-v<x.y.z>.zip`
static MODEL_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<filename>[^/]+)-v(?P<version>\d+\.\d+\.\d+)").expect("model url pattern is valid")
});

/// One input volume a model expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInput {
    /// User-displayable name.
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_pattern: Option<String>,
}

impl ModelInput {
    fn default_inputs() -> Vec<Self> {
        vec![Self {
            title: "Input volume".to_string(),
            name_pattern: None,
        }]
    }
}

/// A single downloadable version of a segmentation model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescription {
    /// `<filename>-v<version>`, unique across the catalog.
    pub id: String,
    pub title: String,
    pub version: String,
    pub inputs: Vec<ModelInput>,
    pub imaging_modality: String,
    pub description: String,
    pub sample_data: Option<serde_json::Value>,
    pub segment_names: Option<Vec<String>>,
    /// Human-readable summary (HTML fragment).
    pub details: String,
    pub url: String,
    /// Every version after the first listed one is deprecated.
    pub deprecated: bool,
}

#[derive(Debug, Deserialize)]
struct ModelsFile {
    models: Vec<RawModel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawModel {
    title: String,
    description: String,
    imaging_modality: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    inputs: Option<Vec<ModelInput>>,
    #[serde(default)]
    segment_names: Option<Vec<String>>,
    #[serde(default)]
    sample_data: Option<serde_json::Value>,
    #[serde(default, rename = "segmentationTimeSecGPU")]
    segmentation_time_sec_gpu: Option<f64>,
    #[serde(default, rename = "segmentationTimeSecCPU")]
    segmentation_time_sec_cpu: Option<f64>,
    versions: Vec<RawVersion>,
}

#[derive(Debug, Deserialize)]
struct RawVersion {
    url: String,
}

/// Split a model archive URL into `(filename, version)`.
pub fn parse_model_url(url: &str) -> Option<(&str, &str)> {
    let caps = MODEL_URL_PATTERN.captures(url)?;
    Some((caps.name("filename")?.as_str(), caps.name("version")?.as_str()))
}

/// Parse a `Models.json` document into one description per model version.
pub fn parse_models_json(json: &str) -> Result<Vec<ModelDescription>, serde_json::Error> {
    let file: ModelsFile = serde_json::from_str(json)?;
    let mut models = Vec::new();
    for raw in file.models {
        let mut deprecated = false;
        for version in &raw.versions {
            let Some((filename, number)) = parse_model_url(&version.url) else {
                warn!(url = %version.url, "Failed to extract model id and version from url");
                continue;
            };
            models.push(ModelDescription {
                id: format!("{filename}-v{number}"),
                title: raw.title.clone(),
                version: number.to_string(),
                inputs: raw.inputs.clone().unwrap_or_else(ModelInput::default_inputs),
                imaging_modality: raw.imaging_modality.clone(),
                description: raw.description.clone(),
                sample_data: raw.sample_data.clone(),
                segment_names: raw.segment_names.clone(),
                details: details(&raw, number),
                url: version.url.clone(),
                deprecated,
            });
            deprecated = true;
        }
    }
    Ok(models)
}

fn details(raw: &RawModel, version: &str) -> String {
    let segments = match &raw.segment_names {
        Some(names) if !names.is_empty() => names.join(", "),
        _ => "N/A".to_string(),
    };
    format!(
        "<p><b>Model:</b> {} (v{version})\
         <p><b>Description:</b> {}\n\
         <p><b>Computation time on GPU:</b> {}\n\
         <br><b>Computation time on CPU:</b> {}\n\
         <p><b>Imaging modality:</b> {}\n\
         <p><b>Subject:</b> {}\n\
         <p><b>Segments:</b> {segments}",
        raw.title,
        raw.description,
        human_readable_time_from_sec(raw.segmentation_time_sec_gpu),
        human_readable_time_from_sec(raw.segmentation_time_sec_cpu),
        raw.imaging_modality,
        raw.subject.as_deref().unwrap_or("N/A"),
    )
}

/// Coarse duration label: 5 s steps under 55 s, whole minutes under an
/// hour, tenths of an hour beyond. Zero or unknown gives `"N/A"`.
pub fn human_readable_time_from_sec(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds.filter(|s| *s > 0.0) else {
        return "N/A".to_string();
    };
    if seconds < 55.0 {
        format!("{} sec", ((seconds / 5.0).ceil() * 5.0) as u64)
    } else if seconds < 3600.0 {
        format!("{} min", (seconds / 60.0).ceil() as u64)
    } else {
        format!("{:.1} h", seconds / 3600.0)
    }
}
