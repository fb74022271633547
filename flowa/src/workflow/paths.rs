//! Declarative directory layout
//!
//! A [`PathPlan`] maps each role to one or more templates plus how the role is
//! treated when an event starts: whether it names a file or a directory,
//! whether it is created, and whether it must already exist. Templates may use
//! `{workdir}`, `{source}` and `{eval}`.
//!
//! Two presets are provided; individual roles can be overridden from
//! `[paths.roles]`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{PathStructureKind, PathsConfig};
use crate::error::{FlowaError, Result};

pub const WORKDIR: &str = "workdir";
pub const DATASETS: &str = "datasets";
pub const FIGURES: &str = "figures";
pub const LOGS: &str = "logs";
pub const RESPONSES: &str = "responses";
pub const WAVEFORMS: &str = "waveforms";
pub const SYNTHETICS: &str = "synthetics";
pub const ADJSRCS: &str = "adjsrcs";
pub const STATIONS_FILE: &str = "stations_file";
pub const EVENT_FILE: &str = "event_file";
pub const MISFIT_FILE: &str = "misfit_file";

/// Roles every plan must define
const REQUIRED_ROLES: [&str; 7] = [
    WORKDIR,
    DATASETS,
    FIGURES,
    LOGS,
    SYNTHETICS,
    ADJSRCS,
    STATIONS_FILE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Directory,
    File,
}

/// How one role is resolved
#[derive(Debug, Clone, PartialEq)]
pub struct RoleSpec {
    pub templates: Vec<String>,
    pub kind: RoleKind,
    /// Create the directory (or the file's parent) when resolving
    pub create: bool,
    /// Fail the event when the path does not exist
    pub must_exist: bool,
}

impl RoleSpec {
    fn dir(templates: &[&str], create: bool) -> Self {
        Self {
            templates: templates.iter().map(|t| t.to_string()).collect(),
            kind: RoleKind::Directory,
            create,
            must_exist: false,
        }
    }

    fn file(template: &str, create: bool, must_exist: bool) -> Self {
        Self {
            templates: vec![template.to_string()],
            kind: RoleKind::File,
            create,
            must_exist,
        }
    }
}

/// Role name → resolution rule
#[derive(Debug, Clone, PartialEq)]
pub struct PathPlan {
    structure: PathStructureKind,
    roles: BTreeMap<String, RoleSpec>,
}

impl PathPlan {
    /// Built-in layout for a deployment convention
    pub fn preset(structure: PathStructureKind) -> Self {
        let roles: Vec<(&str, RoleSpec)> = match structure {
            PathStructureKind::Seisflows => vec![
                (WORKDIR, RoleSpec::dir(&["{workdir}/scratch/solver/{source}"], false)),
                (DATASETS, RoleSpec::dir(&["{workdir}/scratch/preprocess/datasets"], true)),
                (FIGURES, RoleSpec::dir(&["{workdir}/scratch/preprocess/figures"], true)),
                (LOGS, RoleSpec::dir(&["{workdir}/scratch/preprocess/logs"], true)),
                (RESPONSES, RoleSpec::dir(&["{workdir}/scratch/data/seed"], false)),
                (
                    WAVEFORMS,
                    RoleSpec::dir(
                        &[
                            "{workdir}/scratch/data/mseeds",
                            "{workdir}/scratch/solver/{source}/traces/obs",
                        ],
                        false,
                    ),
                ),
                (
                    SYNTHETICS,
                    RoleSpec::dir(&["{workdir}/scratch/solver/{source}/traces/syn"], false),
                ),
                (
                    ADJSRCS,
                    RoleSpec::dir(&["{workdir}/scratch/solver/{source}/traces/adj"], true),
                ),
                (
                    STATIONS_FILE,
                    RoleSpec::file("{workdir}/scratch/solver/{source}/DATA/STATIONS", false, true),
                ),
                (
                    EVENT_FILE,
                    RoleSpec::file("{workdir}/scratch/solver/{source}/DATA/CMTSOLUTION", false, false),
                ),
                (
                    MISFIT_FILE,
                    RoleSpec::file("{workdir}/scratch/residuals/{eval}_{source}", true, false),
                ),
            ],
            PathStructureKind::Standalone => vec![
                (WORKDIR, RoleSpec::dir(&["{workdir}"], true)),
                (DATASETS, RoleSpec::dir(&["{workdir}/datasets"], true)),
                (FIGURES, RoleSpec::dir(&["{workdir}/figures"], true)),
                (LOGS, RoleSpec::dir(&["{workdir}/logs"], true)),
                (RESPONSES, RoleSpec::dir(&["{workdir}/input/responses"], false)),
                (WAVEFORMS, RoleSpec::dir(&["{workdir}/input/waveforms/{source}"], false)),
                (SYNTHETICS, RoleSpec::dir(&["{workdir}/input/synthetics/{source}"], false)),
                (ADJSRCS, RoleSpec::dir(&["{workdir}/adjsrcs/{source}"], true)),
                (
                    STATIONS_FILE,
                    RoleSpec::file("{workdir}/input/STATIONS", false, true),
                ),
                (
                    EVENT_FILE,
                    RoleSpec::file("{workdir}/input/sources/CMTSOLUTION_{source}", false, false),
                ),
                (MISFIT_FILE, RoleSpec::file("{workdir}/misfits/{eval}_{source}", true, false)),
            ],
        };

        Self {
            structure,
            roles: roles
                .into_iter()
                .map(|(name, spec)| (name.to_string(), spec))
                .collect(),
        }
    }

    /// Preset for the configured structure with `[paths.roles]` overrides
    ///
    /// An override replaces the templates of a known role and keeps its
    /// kind and flags. An empty override removes the role.
    pub fn from_config(config: &PathsConfig) -> Result<Self> {
        let mut plan = Self::preset(config.structure);
        for (role, templates) in &config.roles {
            let spec = plan.roles.get_mut(role).ok_or_else(|| {
                FlowaError::Config(format!("Unknown path role '{}' in [paths.roles]", role))
            })?;
            if templates.is_empty() {
                plan.roles.remove(role);
            } else {
                spec.templates = templates.clone();
            }
        }
        for role in REQUIRED_ROLES {
            if !plan.roles.contains_key(role) {
                return Err(FlowaError::MissingPathRole(role.to_string()));
            }
        }
        Ok(plan)
    }

    pub fn structure(&self) -> PathStructureKind {
        self.structure
    }

    pub fn role(&self, name: &str) -> Option<&RoleSpec> {
        self.roles.get(name)
    }

    /// Directory holding one subdirectory per source, for discovery
    pub fn sources_dir(&self, workdir: &Path) -> PathBuf {
        match self.structure {
            PathStructureKind::Seisflows => workdir.join("scratch").join("solver"),
            PathStructureKind::Standalone => workdir.join("input").join("synthetics"),
        }
    }

    /// Resolve every role for one source, creating and checking paths
    pub fn resolve(&self, workdir: &Path, source: &str, eval: &str) -> Result<EventPaths> {
        let workdir_text = workdir.to_string_lossy();
        let mut resolved = BTreeMap::new();

        for (role, spec) in &self.roles {
            let paths: Vec<PathBuf> = spec
                .templates
                .iter()
                .map(|t| {
                    let expanded = t
                        .replace("{workdir}", &workdir_text)
                        .replace("{source}", source)
                        .replace("{eval}", eval);
                    let path = PathBuf::from(expanded);
                    if path.is_relative() {
                        workdir.join(path)
                    } else {
                        path
                    }
                })
                .collect();

            for path in &paths {
                match (spec.kind, spec.create) {
                    (RoleKind::Directory, true) => std::fs::create_dir_all(path)?,
                    (RoleKind::File, true) => {
                        if let Some(parent) = path.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                    }
                    _ => {}
                }
                if spec.must_exist && !path.exists() {
                    return Err(FlowaError::MissingFile(path.clone()));
                }
            }
            debug!(role = %role, paths = ?paths, "Resolved path role");
            resolved.insert(role.clone(), paths);
        }

        Ok(EventPaths {
            source: source.to_string(),
            roles: resolved,
        })
    }
}

/// Resolved paths for one source
#[derive(Debug, Clone)]
pub struct EventPaths {
    source: String,
    roles: BTreeMap<String, Vec<PathBuf>>,
}

impl EventPaths {
    /// Every root of a role, in lookup order; empty when the role is undefined
    pub fn all(&self, role: &str) -> &[PathBuf] {
        self.roles.get(role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First root of a role
    pub fn first(&self, role: &str) -> Option<&Path> {
        self.all(role).first().map(PathBuf::as_path)
    }

    /// First root of a role the workflow cannot do without
    pub fn require(&self, role: &str) -> Result<&Path> {
        self.first(role)
            .ok_or_else(|| FlowaError::MissingPathRole(role.to_string()))
    }

    /// Event archive file inside the datasets directory
    pub fn dataset_file(&self) -> Result<PathBuf> {
        Ok(self.require(DATASETS)?.join(format!("{}.db", self.source)))
    }
}

/// Source names found in `dir`: subdirectories, symlinks excluded
pub fn discover_sources(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_symlink() || !file_type.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}
