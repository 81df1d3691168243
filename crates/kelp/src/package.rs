//! chart package layout
//!
//! A package root holds the overlay configuration and a template directory (`templates/` by
//! default). Files below the template directory are templated manifests when their extension
//! matches, everything else is copied through.
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File names the overlay engine looks for in the package root, in order of preference
pub const OVERLAY_CONFIG_NAMES: [&str; 3] =
    ["kustomization.yaml", "kustomization.yml", "Kustomization"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageLayout {
    /// relative to the package root
    pub templates_dir: PathBuf,
    /// extensions of templated manifests, without the leading dot
    pub extensions: Vec<String>,
}

impl Default for PackageLayout {
    fn default() -> Self {
        Self {
            templates_dir: PathBuf::from("templates"),
            extensions: vec!["yaml".to_string()],
        }
    }
}

impl PackageLayout {
    pub fn is_templated(&self, path: &Path) -> bool {
        let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };

        self.extensions
            .iter()
            .any(|candidate| candidate.trim_start_matches('.') == extension)
    }
}

#[derive(Debug)]
pub struct Package {
    root: PathBuf,
    layout: PackageLayout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFile {
    pub path: PathBuf,
    /// relative to the package root
    pub relative: PathBuf,
    pub templated: bool,
}

impl Package {
    pub fn open(root: &Path, layout: PackageLayout) -> Result<Self, PackageError> {
        let root = root
            .canonicalize()
            .map_err(|source| PackageError::NotFound {
                path: root.to_owned(),
                source,
            })?;

        if !root.is_dir() {
            return Err(PackageError::NotADirectory(root));
        }

        let templates = root.join(&layout.templates_dir);
        if !templates.is_dir() {
            return Err(PackageError::TemplatesNotFound(templates));
        }

        tracing::info!(root=%root.display(), "package opened");
        Ok(Self { root, layout })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> &PackageLayout {
        &self.layout
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root.join(&self.layout.templates_dir)
    }

    pub fn overlay_config(&self) -> Option<PathBuf> {
        OVERLAY_CONFIG_NAMES
            .iter()
            .map(|name| self.root.join(name))
            .find(|path| path.is_file())
    }

    /// All files below the template directory, sorted by path
    pub fn files(&self) -> Result<Vec<PackageFile>, PackageError> {
        let mut files = Vec::new();

        for entry in WalkDir::new(self.templates_dir())
            .min_depth(1)
            .sort_by_file_name()
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.into_path();
            let Ok(relative) = path.strip_prefix(&self.root).map(Path::to_path_buf) else {
                continue;
            };

            files.push(PackageFile {
                templated: self.layout.is_templated(&path),
                relative,
                path,
            });
        }

        tracing::debug!(count = files.len(), "package files listed");
        Ok(files)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PackageError {
    #[error("package directory {} not found", .path.display())]
    NotFound {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("template directory {} not found", .0.display())]
    TemplatesNotFound(PathBuf),
    #[error("unable to list package files")]
    Walk(#[from] walkdir::Error),
}
