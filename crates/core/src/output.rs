//! Output artifact model and selection policy.
//!
//! The backend records outputs per node as
//! `{"<node_id>": {"images": [{filename, subfolder, type}], "gifs": [...], "text": [...]}}`.
//! [`collect_artifacts`] flattens that into classified artifacts in the
//! recorded order; [`select_artifact`] applies the preference
//! image > video > text.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::media;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Backend storage area an artifact lives in (the `type` query parameter
/// of the artifact fetch endpoint).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationClass {
    #[default]
    Output,
    Temp,
    Input,
}

impl LocationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationClass::Output => "output",
            LocationClass::Temp => "temp",
            LocationClass::Input => "input",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Text,
}

/// One produced-file descriptor as recorded in the backend history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub location: LocationClass,
}

/// Where the artifact's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// A stored file, fetched through the backend's artifact endpoint.
    File(FileDescriptor),
    /// Text the backend returned inline in the history record.
    Inline(String),
}

/// A classified output of a completed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArtifact {
    pub node_id: String,
    pub kind: MediaKind,
    pub source: ArtifactSource,
}

impl OutputArtifact {
    /// File name to present to the caller. Inline text gets a synthetic
    /// `<node_id>.txt` name.
    pub fn filename(&self) -> String {
        match &self.source {
            ArtifactSource::File(file) => file.filename.clone(),
            ArtifactSource::Inline(_) => format!("{}.txt", self.node_id),
        }
    }

    pub fn media_type(&self) -> &'static str {
        media::media_type_for(self.kind, &self.filename())
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Output keys that always hold video / animated formats.
const VIDEO_KEYS: &[&str] = &["gifs", "videos", "video"];

/// Flatten recorded node outputs into artifacts, preserving node order and
/// the order of entries within each node.
///
/// Entries that cannot be understood (missing filename, unknown output
/// key such as `audio` or `latents`) are skipped.
pub fn collect_artifacts(outputs: &Map<String, Value>) -> Vec<OutputArtifact> {
    let mut artifacts = Vec::new();

    for (node_id, node_output) in outputs {
        let Some(node_output) = node_output.as_object() else {
            continue;
        };

        // `animated` is a per-node list of flags set by animated savers.
        let animated = node_output
            .get("animated")
            .and_then(Value::as_array)
            .is_some_and(|flags| flags.iter().any(|f| f.as_bool() == Some(true)));

        for (key, entries) in node_output {
            let Some(entries) = entries.as_array() else {
                continue;
            };

            for entry in entries {
                let artifact = match key.as_str() {
                    "images" => file_entry(entry).map(|file| {
                        let kind = if animated || media::is_video_extension(&file.filename) {
                            MediaKind::Video
                        } else {
                            MediaKind::Image
                        };
                        (kind, ArtifactSource::File(file))
                    }),
                    k if VIDEO_KEYS.contains(&k) => {
                        file_entry(entry).map(|file| (MediaKind::Video, ArtifactSource::File(file)))
                    }
                    "text" => match entry {
                        Value::String(text) => {
                            Some((MediaKind::Text, ArtifactSource::Inline(text.clone())))
                        }
                        other => file_entry(other)
                            .map(|file| (MediaKind::Text, ArtifactSource::File(file))),
                    },
                    _ => None,
                };

                if let Some((kind, source)) = artifact {
                    artifacts.push(OutputArtifact {
                        node_id: node_id.clone(),
                        kind,
                        source,
                    });
                }
            }
        }
    }

    artifacts
}

/// Pick the single artifact to return: first image, else first video,
/// else first text. `None` when nothing recognizable was produced.
pub fn select_artifact(outputs: &Map<String, Value>) -> Option<OutputArtifact> {
    let artifacts = collect_artifacts(outputs);

    [MediaKind::Image, MediaKind::Video, MediaKind::Text]
        .into_iter()
        .find_map(|wanted| artifacts.iter().find(|a| a.kind == wanted).cloned())
}

fn file_entry(entry: &Value) -> Option<FileDescriptor> {
    serde_json::from_value(entry.clone()).ok()
}
