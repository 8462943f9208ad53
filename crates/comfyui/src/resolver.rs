//! Resolves the artifact a completed job produced.

use bytes::Bytes;
use relay_core::output::{select_artifact, ArtifactSource, OutputArtifact};

use crate::api::{ComfyBackend, ComfyUIApiError};
use crate::error::JobError;

/// An artifact together with its content.
#[derive(Debug, Clone)]
pub struct ResolvedOutput {
    pub artifact: OutputArtifact,
    pub bytes: Bytes,
}

impl ResolvedOutput {
    pub fn filename(&self) -> String {
        self.artifact.filename()
    }

    pub fn media_type(&self) -> &'static str {
        self.artifact.media_type()
    }
}

pub struct OutputResolver<'a> {
    backend: &'a dyn ComfyBackend,
}

impl<'a> OutputResolver<'a> {
    pub fn new(backend: &'a dyn ComfyBackend) -> Self {
        Self { backend }
    }

    /// Pick the preferred artifact from the job's history record.
    ///
    /// A missing history record counts as "no output".
    pub async fn select(&self, prompt_id: &str) -> Result<OutputArtifact, JobError> {
        let history = match self.backend.fetch_history(prompt_id).await {
            Ok(history) => history,
            Err(ComfyUIApiError::NotFound(_)) => {
                return Err(JobError::NoOutputFound(prompt_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let artifact = select_artifact(&history.outputs)
            .ok_or_else(|| JobError::NoOutputFound(prompt_id.to_string()))?;

        tracing::debug!(
            prompt_id,
            node_id = %artifact.node_id,
            kind = ?artifact.kind,
            filename = %artifact.filename(),
            "Selected output artifact",
        );
        Ok(artifact)
    }

    /// Load the artifact's bytes. Inline text needs no backend call.
    pub async fn fetch(&self, artifact: &OutputArtifact) -> Result<Bytes, JobError> {
        match &artifact.source {
            ArtifactSource::Inline(text) => Ok(Bytes::from(text.clone())),
            ArtifactSource::File(file) => Ok(self
                .backend
                .fetch_artifact(&file.filename, &file.subfolder, file.location)
                .await?),
        }
    }

    pub async fn resolve(&self, prompt_id: &str) -> Result<ResolvedOutput, JobError> {
        let artifact = self.select(prompt_id).await?;
        let bytes = self.fetch(&artifact).await?;
        Ok(ResolvedOutput { artifact, bytes })
    }
}
