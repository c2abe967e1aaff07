use super::TransportError;
use crate::{config::PayloadConfig, job::Job};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, trace, warn};

/// job record shipped inside every payload
pub const JOB_FILE: &str = "job.yaml";

/// Materializes the working directory of a job under the local staging dir
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    staging: PathBuf,
    template: Option<PathBuf>,
    include: GlobSet,
}

impl PayloadBuilder {
    pub fn new(
        staging: PathBuf,
        template: Option<PathBuf>,
        include: &[String],
    ) -> Result<Self, TransportError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in include {
            builder.add(Glob::new(pattern)?);
        }

        Ok(Self {
            staging,
            template,
            include: builder.build()?,
        })
    }

    pub fn load(staging: &Path, config: &PayloadConfig) -> Result<Self, TransportError> {
        Self::new(
            staging.to_path_buf(),
            config.template.clone(),
            &config.include,
        )
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Build `<staging>/job-<id>`, replacing leftovers of an earlier attempt
    pub fn build(&self, job: &Job) -> Result<PathBuf, TransportError> {
        let target = self.staging.join(job.name());

        if target.exists() {
            debug!(job = job.id, "Replacing stale payload directory");
            fs::remove_dir_all(&target).map_err(|source| TransportError::io(&target, source))?;
        }
        fs::create_dir_all(&target).map_err(|source| TransportError::io(&target, source))?;

        if let Some(ref template) = self.template {
            let copied = self.copy_template(template, &target)?;
            trace!(job = job.id, copied, "Copied template files");
        }

        let record = target.join(JOB_FILE);
        let file =
            fs::File::create(&record).map_err(|source| TransportError::io(&record, source))?;
        serde_yaml::to_writer(file, job)?;

        Ok(target)
    }

    fn copy_template(&self, template: &Path, target: &Path) -> Result<usize, TransportError> {
        let mut copied = 0;

        // templates are plain data directories, ignore files carry no meaning in them
        let walker = WalkBuilder::new(template)
            .standard_filters(false)
            .follow_links(true)
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Failed to walk payload template: {e}");
                    continue;
                }
            };

            if !entry.file_type().is_some_and(|kind| kind.is_file()) {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(template) else {
                continue;
            };
            if !self.include.is_match(relative) {
                continue;
            }

            let destination = target.join(relative);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).map_err(|source| TransportError::io(parent, source))?;
            }
            fs::copy(entry.path(), &destination)
                .map_err(|source| TransportError::io(entry.path(), source))?;
            copied += 1;
        }

        Ok(copied)
    }
}
