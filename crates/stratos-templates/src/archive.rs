//! Gzip tarball of an instance's rendered templates.
//!
//! Each job contributes a `<job>/monit` entry plus one `<job>/<dest_name>`
//! entry per rendered file. The archive is written to a temporary file so
//! large template sets never have to be held in memory twice.

use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{TemplatesError, TemplatesResult};
use crate::rendered::RenderedJobTemplate;

const TEMPFILE_PREFIX: &str = "compressed-rendered-job-templates";
const TEMPFILE_SUFFIX: &str = ".tgz";
const ENTRY_MODE: u32 = 0o644;

/// A compressed archive of rendered templates backed by a temporary file.
///
/// The file is deleted when this value is dropped, on success and error paths
/// alike.
#[derive(Debug)]
pub struct CompressedRenderedJobTemplates {
    file: NamedTempFile,
    sha1: String,
    size: u64,
}

impl CompressedRenderedJobTemplates {
    /// Write the given jobs into a new gzip tarball.
    pub fn write(job_templates: &[RenderedJobTemplate]) -> TemplatesResult<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(TEMPFILE_PREFIX)
            .suffix(TEMPFILE_SUFFIX)
            .tempfile()?;

        {
            let encoder = GzEncoder::new(file.as_file_mut(), Compression::default());
            let mut builder = tar::Builder::new(encoder);

            for job in job_templates {
                append_entry(&mut builder, &format!("{}/monit", job.name), &job.monit)?;
                for template in &job.templates {
                    let path = format!("{}/{}", job.name, template.dest_name);
                    append_entry(&mut builder, &path, &template.contents)?;
                }
            }

            builder.into_inner()?.finish()?;
        }

        let (sha1, size) = digest_file(file.as_file_mut())?;

        debug!(
            path = %file.path().display(),
            jobs = job_templates.len(),
            size,
            sha1 = %sha1,
            "wrote compressed rendered templates"
        );

        Ok(Self { file, sha1, size })
    }

    /// Hex SHA-1 of the compressed archive bytes.
    #[must_use]
    pub fn sha1(&self) -> &str {
        &self.sha1
    }

    /// Size of the compressed archive in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Location of the temporary archive file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Read the full archive into memory.
    pub fn contents(&self) -> TemplatesResult<Bytes> {
        let mut reader = self.file.reopen()?;
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer)?;
        Ok(Bytes::from(buffer))
    }
}

/// Pointer to a delivered archive: where it is stored and its checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedTemplatesArchive {
    /// Identifier of the blob in the shared store or on the agent.
    pub blobstore_id: String,
    /// Hex SHA-1 of the compressed archive bytes.
    pub sha1: String,
}

impl RenderedTemplatesArchive {
    /// Create an archive pointer.
    #[must_use]
    pub fn new(blobstore_id: impl Into<String>, sha1: impl Into<String>) -> Self {
        Self {
            blobstore_id: blobstore_id.into(),
            sha1: sha1.into(),
        }
    }
}

fn append_entry<W: io::Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    contents: &str,
) -> TemplatesResult<()> {
    let size = u64::try_from(contents.len()).map_err(|_| TemplatesError::EntryTooLarge {
        path: path.to_owned(),
    })?;

    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(ENTRY_MODE);
    header.set_entry_type(tar::EntryType::Regular);

    builder.append_data(&mut header, path, contents.as_bytes())?;
    Ok(())
}

fn digest_file(file: &mut std::fs::File) -> io::Result<(String, u64)> {
    file.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha1::new();
    let size = io::copy(file, &mut hasher)?;
    Ok((hex::encode(hasher.finalize()), size))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::rendered::{RenderedJobInstance, RenderedTemplateFile};
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;

    fn instance() -> RenderedJobInstance {
        RenderedJobInstance::new(vec![
            RenderedJobTemplate::new(
                "web",
                "check process web",
                vec![
                    RenderedTemplateFile::new("config.yml.erb", "config/config.yml", "port: 8080"),
                    RenderedTemplateFile::new("ctl.erb", "bin/ctl", "exec web"),
                ],
            ),
            RenderedJobTemplate::new("worker", "check process worker", vec![]),
        ])
    }

    fn unpack(bytes: &[u8]) -> BTreeMap<String, String> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        let mut entries = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut contents = String::new();
            entry.read_to_string(&mut contents).unwrap();
            entries.insert(path, contents);
        }
        entries
    }

    #[test]
    fn archive_lays_out_jobs_by_name() {
        let compressed = instance().generate_compressed_templates().unwrap();
        let entries = unpack(&compressed.contents().unwrap());

        let expected: BTreeMap<String, String> = [
            ("web/monit", "check process web"),
            ("web/config/config.yml", "port: 8080"),
            ("web/bin/ctl", "exec web"),
            ("worker/monit", "check process worker"),
        ]
        .into_iter()
        .map(|(path, contents)| (path.to_owned(), contents.to_owned()))
        .collect();

        assert_eq!(entries, expected);
    }

    #[test]
    fn sha1_matches_archive_bytes() {
        let compressed = instance().generate_compressed_templates().unwrap();
        let bytes = compressed.contents().unwrap();

        let mut digest = Sha1::new();
        digest.update(&bytes);

        assert_eq!(compressed.sha1(), hex::encode(digest.finalize()));
        assert_eq!(compressed.size(), u64::try_from(bytes.len()).unwrap());
    }

    #[test]
    fn temp_file_is_removed_on_drop() {
        let compressed = instance().generate_compressed_templates().unwrap();
        let path = compressed.path().to_owned();
        assert!(path.exists());
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(TEMPFILE_PREFIX));

        drop(compressed);
        assert!(!path.exists());
    }

    #[test]
    fn empty_instance_produces_valid_archive() {
        let compressed = RenderedJobInstance::default()
            .generate_compressed_templates()
            .unwrap();

        assert!(unpack(&compressed.contents().unwrap()).is_empty());
    }
}
