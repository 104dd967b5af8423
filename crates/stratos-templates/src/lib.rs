//! Rendered job templates for a single instance.
//!
//! The template renderer produces one [`RenderedJobTemplate`] per job placed on
//! an instance. This crate groups them into a [`RenderedJobInstance`] and
//! provides the two derived artefacts the director needs:
//!
//! - a deterministic **configuration hash** used as the cache key for
//!   previously delivered archives, and
//! - a **compressed archive** (gzip tarball) that is shipped to the VM either
//!   through the shared blobstore or directly through the agent.
//!
//! # Example
//!
//! ```
//! use stratos_templates::{RenderedJobInstance, RenderedJobTemplate, RenderedTemplateFile};
//!
//! let instance = RenderedJobInstance::new(vec![RenderedJobTemplate::new(
//!     "web",
//!     "check process web",
//!     vec![RenderedTemplateFile::new("config.yml.erb", "config/config.yml", "port: 8080")],
//! )]);
//!
//! let hash = instance.configuration_hash();
//! assert_eq!(hash.len(), 40);
//! ```

#![forbid(unsafe_code)]

pub mod archive;
pub mod error;
pub mod rendered;

pub use archive::{CompressedRenderedJobTemplates, RenderedTemplatesArchive};
pub use error::{TemplatesError, TemplatesResult};
pub use rendered::{RenderedJobInstance, RenderedJobTemplate, RenderedTemplateFile};
