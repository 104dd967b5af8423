//! Rendered template model and deterministic hashing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::archive::CompressedRenderedJobTemplates;
use crate::error::TemplatesResult;

/// A single rendered template file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedTemplateFile {
    /// Template name inside the job package (e.g. `config.yml.erb`).
    pub src_name: String,
    /// Destination path relative to the job directory on the VM.
    pub dest_name: String,
    /// Rendered file contents.
    pub contents: String,
}

impl RenderedTemplateFile {
    /// Create a rendered template file.
    #[must_use]
    pub fn new(
        src_name: impl Into<String>,
        dest_name: impl Into<String>,
        contents: impl Into<String>,
    ) -> Self {
        Self {
            src_name: src_name.into(),
            dest_name: dest_name.into(),
            contents: contents.into(),
        }
    }
}

/// Rendered output for one job on an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedJobTemplate {
    /// Job name.
    pub name: String,
    /// Rendered process-supervision (monit) control file.
    pub monit: String,
    /// Rendered template files, in the order the renderer produced them.
    pub templates: Vec<RenderedTemplateFile>,
}

impl RenderedJobTemplate {
    /// Create a rendered job template.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        monit: impl Into<String>,
        templates: Vec<RenderedTemplateFile>,
    ) -> Self {
        Self {
            name: name.into(),
            monit: monit.into(),
            templates,
        }
    }

    /// SHA-1 over the monit file and every template's contents.
    ///
    /// Files are visited in `src_name` order, so the result does not depend on
    /// the order the renderer produced them in.
    #[must_use]
    pub fn template_hash(&self) -> String {
        let mut digest = Sha1::new();
        digest.update(self.monit.as_bytes());
        for file in self.sorted_templates() {
            digest.update(file.contents.as_bytes());
        }
        hex::encode(digest.finalize())
    }

    /// Template files sorted by source name.
    #[must_use]
    pub fn sorted_templates(&self) -> Vec<&RenderedTemplateFile> {
        let mut files: Vec<_> = self.templates.iter().collect();
        files.sort_by(|a, b| a.src_name.cmp(&b.src_name));
        files
    }
}

/// All rendered job templates for a single instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderedJobInstance {
    job_templates: Vec<RenderedJobTemplate>,
}

impl RenderedJobInstance {
    /// Create a rendered job instance from the renderer's output.
    #[must_use]
    pub const fn new(job_templates: Vec<RenderedJobTemplate>) -> Self {
        Self { job_templates }
    }

    /// The rendered job templates in the order they were supplied.
    #[must_use]
    pub fn job_templates(&self) -> &[RenderedJobTemplate] {
        &self.job_templates
    }

    /// Whether no jobs were rendered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.job_templates.is_empty()
    }

    /// Cache key for the instance's rendered configuration.
    ///
    /// Jobs are visited in name order. For each job the monit text and the job
    /// name are fed into the digest, followed by every template's contents and
    /// destination name in `src_name` order. The hex SHA-1 is returned.
    #[must_use]
    pub fn configuration_hash(&self) -> String {
        let mut digest = Sha1::new();

        for job in self.sorted_jobs() {
            digest.update(job.monit.as_bytes());
            digest.update(job.name.as_bytes());

            for file in job.sorted_templates() {
                digest.update(file.contents.as_bytes());
                digest.update(file.dest_name.as_bytes());
            }
        }

        hex::encode(digest.finalize())
    }

    /// Per-job [`RenderedJobTemplate::template_hash`] keyed by job name.
    #[must_use]
    pub fn template_hashes(&self) -> BTreeMap<String, String> {
        self.job_templates
            .iter()
            .map(|job| (job.name.clone(), job.template_hash()))
            .collect()
    }

    /// Write the rendered templates into a compressed archive.
    ///
    /// The archive lives in a temporary file that is removed when the returned
    /// value is dropped. This performs blocking I/O.
    pub fn generate_compressed_templates(&self) -> TemplatesResult<CompressedRenderedJobTemplates> {
        CompressedRenderedJobTemplates::write(&self.job_templates)
    }

    fn sorted_jobs(&self) -> Vec<&RenderedJobTemplate> {
        let mut jobs: Vec<_> = self.job_templates.iter().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }
}

impl From<Vec<RenderedJobTemplate>> for RenderedJobInstance {
    fn from(job_templates: Vec<RenderedJobTemplate>) -> Self {
        Self::new(job_templates)
    }
}
