//! overlay engine invocation
//!
//! The overlay engine is an external collaborator. We rely on three properties only:
//! - it accepts valid YAML
//! - one input document gives one output document
//! - its errors carry a human readable message, which we pass on verbatim
//!
//! All escaped documents of a package go into one build, so patches that target one document
//! do not break the build of another. The engine maps its output back to the source
//! documents ([BuildOutput]).
//!
//! Engines may read and write working state below the package root, so the [OverlayInvoker]
//! runs at most one build per package root at a time.
use crate::cancel::Cancellation;
use crate::package::Package;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

mod kustomize;
mod passthrough;

pub use kustomize::Kustomize;
pub use passthrough::Passthrough;

/// One escaped document of a build
#[derive(Debug, derive_new::new)]
pub struct BuildDocument<'a> {
    /// relative to the package root
    pub path: &'a Path,
    /// escaped text, valid YAML
    pub text: &'a str,
}

/// Input of one engine build
#[derive(Debug, derive_new::new)]
pub struct BuildRequest<'a> {
    /// canonical package root
    pub package_root: &'a Path,
    /// overlay configuration file below the package root, if the package has one
    pub overlay_config: Option<&'a Path>,
    pub documents: &'a [BuildDocument<'a>],
    /// templated documents of the package that must be left out of the build
    pub withheld: &'a [&'a Path],
}

/// Overlay output, per source document
#[derive(Debug, Default)]
pub struct BuildOutput {
    documents: BTreeMap<PathBuf, Result<String, OverlayError>>,
}

impl BuildOutput {
    pub fn insert(&mut self, path: impl Into<PathBuf>, output: Result<String, OverlayError>) {
        self.documents.insert(path.into(), output);
    }

    /// Add an output document for `path`, separated from earlier ones by `---`
    pub fn append(&mut self, path: impl Into<PathBuf>, document: &str) {
        match self.documents.entry(path.into()) {
            Entry::Vacant(entry) => {
                entry.insert(Ok(document.to_string()));
            }
            Entry::Occupied(mut entry) => {
                if let Ok(text) = entry.get_mut() {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str("---\n");
                    text.push_str(document);
                }
            }
        }
    }

    /// Remove and return the output of `path`
    pub fn take(&mut self, path: &Path) -> Result<String, OverlayError> {
        self.documents
            .remove(path)
            .unwrap_or(Err(OverlayError::MissingOutput))
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.documents.keys().map(PathBuf::as_path)
    }
}

pub trait OverlayEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Overlay all documents of a request in one build
    fn build(
        &self,
        request: &BuildRequest,
        cancellation: &Cancellation,
    ) -> Result<BuildOutput, OverlayError>;
}

#[derive(thiserror::Error, Debug)]
pub enum OverlayError {
    /// message exactly as reported by the engine
    #[error("{message}")]
    Engine { message: String },
    #[error("unable to start overlay engine {}", .program.display())]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to prepare overlay workspace")]
    Staging(#[source] std::io::Error),
    #[error("invalid overlay configuration {}", .path.display())]
    Config {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("unexpected overlay configuration {}: {reason}", .path.display())]
    ConfigShape { path: PathBuf, reason: &'static str },
    #[error("lost contact with overlay engine")]
    Process(#[source] std::io::Error),
    #[error("overlay output is not valid UTF-8")]
    OutputNotUtf8(#[source] std::string::FromUtf8Error),
    #[error("unable to read overlay output")]
    Output(#[source] serde_yaml::Error),
    #[error("overlay engine produced no output for this document")]
    MissingOutput,
    #[error("cancelled")]
    Cancelled,
}

pub struct OverlayInvoker {
    engine: Box<dyn OverlayEngine>,
    roots: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl OverlayInvoker {
    pub fn new(engine: impl OverlayEngine + 'static) -> Self {
        Self {
            engine: Box::new(engine),
            roots: Default::default(),
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn invoke(
        &self,
        package: &Package,
        documents: &[BuildDocument],
        withheld: &[&Path],
        cancellation: &Cancellation,
    ) -> Result<BuildOutput, OverlayError> {
        let root = self.root_lock(package.root());
        let _guard = root.lock().unwrap_or_else(PoisonError::into_inner);

        if cancellation.is_cancelled() {
            return Err(OverlayError::Cancelled);
        }

        tracing::info!(
            engine = self.engine.name(),
            documents = documents.len(),
            withheld = withheld.len(),
            "invoking overlay engine"
        );

        let overlay_config = package.overlay_config();
        let request = BuildRequest::new(
            package.root(),
            overlay_config.as_deref(),
            documents,
            withheld,
        );
        let output = self.engine.build(&request, cancellation)?;

        tracing::trace!(documents = output.documents.len(), "overlay engine output");
        Ok(output)
    }

    fn root_lock(&self, package_root: &Path) -> Arc<Mutex<()>> {
        let mut roots = self.roots.lock().unwrap_or_else(PoisonError::into_inner);
        roots.entry(package_root.to_owned()).or_default().clone()
    }
}

impl std::fmt::Debug for OverlayInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayInvoker")
            .field("engine", &self.engine.name())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::package::PackageLayout;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn package_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("templates")).unwrap();
        dir
    }

    /// Records the highest number of builds running at once
    #[derive(Default)]
    struct Concurrency {
        running: AtomicUsize,
        peak: Arc<AtomicUsize>,
    }

    impl OverlayEngine for Concurrency {
        fn name(&self) -> &'static str {
            "concurrency"
        }

        fn build(
            &self,
            request: &BuildRequest,
            _: &Cancellation,
        ) -> Result<BuildOutput, OverlayError> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            self.running.fetch_sub(1, Ordering::SeqCst);

            let mut output = BuildOutput::default();
            for document in request.documents {
                output.insert(document.path, Ok(document.text.to_string()));
            }
            Ok(output)
        }
    }

    #[test]
    fn builds_are_serialized_per_root() {
        let dir = package_dir();
        let package = Package::open(dir.path(), PackageLayout::default()).unwrap();

        let engine = Concurrency::default();
        let peak = engine.peak.clone();
        let invoker = OverlayInvoker::new(engine);
        let cancellation = Cancellation::new();
        let documents = [BuildDocument::new(
            Path::new("templates/a.yaml"),
            "a: \"{{ .a }}\"\n",
        )];

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| invoker.invoke(&package, &documents, &[], &cancellation).unwrap());
            }
        });

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(invoker.engine_name(), "concurrency");
    }

    #[test]
    fn cancelled_before_build() {
        let dir = package_dir();
        let package = Package::open(dir.path(), PackageLayout::default()).unwrap();
        let invoker = OverlayInvoker::new(Passthrough);
        let cancellation = Cancellation::new();
        cancellation.cancel();

        assert!(matches!(
            invoker.invoke(&package, &[], &[], &cancellation),
            Err(OverlayError::Cancelled)
        ));
    }

    #[test]
    fn output_per_document() {
        let mut output = BuildOutput::default();
        output.append("templates/a.yaml", "kind: Service\n");
        output.append("templates/a.yaml", "kind: Deployment");
        output.append("templates/a.yaml", "kind: Pod\n");

        assert_eq!(
            output.paths().collect::<Vec<_>>(),
            vec![Path::new("templates/a.yaml")]
        );
        assert_eq!(
            output.take(Path::new("templates/a.yaml")).unwrap(),
            "kind: Service\n---\nkind: Deployment\n---\nkind: Pod\n"
        );
        assert!(matches!(
            output.take(Path::new("templates/a.yaml")),
            Err(OverlayError::MissingOutput)
        ));
    }
}
