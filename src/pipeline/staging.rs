//! Run-directory preparation.
//!
//! Before a job's first pending phase, shared inputs are linked into its run
//! directory with relative symlinks, the job-input file is rendered, and on a fresh
//! start stale tool caches are removed.

use crate::catalog::PairJob;
use crate::config::{JobFileConfig, StagingConfig};
use crate::pipeline::render_template;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Staging failure. Always fatal to the owning job.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("raw scene not found: {0}")]
    MissingScene(PathBuf),

    #[error("staging I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StagingError + '_ {
    move |source| StagingError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Prepares run directories.
#[derive(Debug, Clone, Default)]
pub struct Stager {
    config: StagingConfig,
    job_file: Option<JobFileConfig>,
}

impl Stager {
    pub fn new(config: StagingConfig, job_file: Option<JobFileConfig>) -> Self {
        Self { config, job_file }
    }

    /// Prepare the run directory of `job`. `fresh_start` is true when no phase of the
    /// job has completed yet.
    pub fn prepare(&self, job: &PairJob, fresh_start: bool) -> Result<(), StagingError> {
        let run_dir = &job.output_dir;
        fs::create_dir_all(run_dir).map_err(io_err(run_dir))?;

        if fresh_start {
            self.clean(run_dir)?;
        }

        if let Some(raw_dir) = &self.config.raw_dir {
            for scene in [&job.pair.reference, &job.pair.secondary] {
                let src = raw_dir.join(scene);
                if !src.exists() {
                    return Err(StagingError::MissingScene(src));
                }
                link_into(&src, run_dir)?;
            }
        }

        if let Some(dem) = &self.config.dem_path {
            for src in dem_files(dem) {
                if src.exists() {
                    link_into(&src, run_dir)?;
                } else {
                    tracing::warn!("[{}] DEM file missing: {}", job.id, src.display());
                }
            }
        }

        if let Some(orbit_dir) = &self.config.orbit_dir {
            match orbit_files(orbit_dir) {
                Ok(orbits) if orbits.is_empty() => {
                    tracing::warn!("[{}] No orbit files in {}", job.id, orbit_dir.display())
                }
                Ok(orbits) => {
                    for src in orbits {
                        link_into(&src, run_dir)?;
                    }
                }
                Err(e) => tracing::warn!("[{}] Cannot list orbit dir {}: {}", job.id, orbit_dir.display(), e),
            }
        }

        if let Some(job_file) = &self.job_file {
            let path = run_dir.join(&job_file.name);
            fs::write(&path, self.render_job_file(job, job_file)).map_err(io_err(&path))?;
        }

        Ok(())
    }

    fn clean(&self, run_dir: &Path) -> Result<(), StagingError> {
        for name in &self.config.clean_on_fresh_start {
            let path = run_dir.join(name);
            match fs::remove_dir_all(&path) {
                Ok(()) => tracing::debug!("Removed stale {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(StagingError::Io { path, source }),
            }
        }
        Ok(())
    }

    fn render_job_file(&self, job: &PairJob, job_file: &JobFileConfig) -> String {
        let dem = self
            .config
            .dem_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bound = |f: fn(&crate::catalog::Roi) -> f64| job.roi.as_ref().map(|r| f(r).to_string()).unwrap_or_default();

        render_template(
            &job_file.template,
            &[
                ("reference", job.pair.reference.clone()),
                ("secondary", job.pair.secondary.clone()),
                ("dem", dem),
                ("job_id", job.id.to_string()),
                ("south", bound(|r| r.south)),
                ("north", bound(|r| r.north)),
                ("west", bound(|r| r.west)),
                ("east", bound(|r| r.east)),
            ],
        )
    }
}

fn dem_files(dem: &Path) -> Vec<PathBuf> {
    ["", ".xml", ".vrt"]
        .iter()
        .map(|ext| {
            let mut name = dem.as_os_str().to_owned();
            name.push(ext);
            PathBuf::from(name)
        })
        .collect()
}

fn orbit_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("eof")) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Link `src` into `dir` under its own file name, replacing whatever is there.
fn link_into(src: &Path, dir: &Path) -> Result<(), StagingError> {
    let name = src.file_name().ok_or_else(|| StagingError::Io {
        path: src.to_path_buf(),
        source: std::io::Error::new(ErrorKind::InvalidInput, "path has no file name"),
    })?;
    let dst = dir.join(name);

    if let Ok(meta) = fs::symlink_metadata(&dst) {
        if meta.is_dir() {
            fs::remove_dir_all(&dst).map_err(io_err(&dst))?;
        } else {
            fs::remove_file(&dst).map_err(io_err(&dst))?;
        }
    }

    let src_abs = std::path::absolute(src).map_err(io_err(src))?;
    let dir_abs = std::path::absolute(dir).map_err(io_err(dir))?;
    symlink(&relative_path(&dir_abs, &src_abs), &dst).map_err(io_err(&dst))
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(ErrorKind::Unsupported, "staging requires symlink support"))
}

/// Path of `target` relative to `base`. Both must be absolute; if they share no
/// root, `target` is returned unchanged.
fn relative_path(base: &Path, target: &Path) -> PathBuf {
    let base: Vec<Component> = base.components().collect();
    let target: Vec<Component> = target.components().collect();
    let common = base.iter().zip(&target).take_while(|(a, b)| a == b).count();
    if common == 0 {
        return target.iter().collect();
    }

    let mut rel = PathBuf::new();
    for _ in common..base.len() {
        rel.push("..");
    }
    for component in &target[common..] {
        rel.push(component.as_os_str());
    }
    rel
}
