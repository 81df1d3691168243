use super::{BuildOutput, BuildRequest, OverlayEngine, OverlayError};
use crate::cancel::Cancellation;
use crate::package::OVERLAY_CONFIG_NAMES;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use walkdir::WalkDir;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// `buildMetadata` option that makes kustomize annotate every resource with its source
const ORIGIN_ANNOTATIONS: &str = "originAnnotations";
const ORIGIN_ANNOTATION: &str = "config.kubernetes.io/origin";

/// Runs a kustomize build against a staged copy of the package
///
/// The package root is copied into a temporary directory and the templates are replaced by
/// their escaped text. The whole package is built at once, so patches and generators apply as
/// they would to the rendered chart. Origin annotations map the output back to the templates
/// and are removed again unless the package asked for them.
#[derive(Debug, Clone)]
pub struct Kustomize {
    program: PathBuf,
    args: Vec<String>,
}

impl Kustomize {
    /// `program` and `args` are invoked with the staging directory appended
    pub fn new(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn run(&self, staging: &Path, cancellation: &Cancellation) -> Result<Vec<u8>, OverlayError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(staging)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| OverlayError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(status) = child.try_wait().map_err(OverlayError::Process)? {
                break status;
            }

            if cancellation.is_cancelled() {
                tracing::debug!(pid = child.id(), "killing overlay engine");
                let _ = child.kill();
                let _ = child.wait();
                return Err(OverlayError::Cancelled);
            }

            std::thread::sleep(POLL_INTERVAL);
        };

        let stdout = join(stdout)?;
        let stderr = join(stderr)?;

        if !status.success() {
            let message = String::from_utf8_lossy(&stderr).trim_end().to_string();
            let message = if message.is_empty() {
                format!("{} exited with {status}", self.program.display())
            } else {
                message
            };
            return Err(OverlayError::Engine { message });
        }

        Ok(stdout)
    }
}

impl Default for Kustomize {
    fn default() -> Self {
        Self::new("kustomize", ["build"])
    }
}

impl OverlayEngine for Kustomize {
    fn name(&self) -> &'static str {
        "kustomize"
    }

    fn build(
        &self,
        request: &BuildRequest,
        cancellation: &Cancellation,
    ) -> Result<BuildOutput, OverlayError> {
        let staging = tempfile::Builder::new()
            .prefix("kelp-")
            .tempdir()
            .map_err(OverlayError::Staging)?;

        stage_package(request.package_root, staging.path())?;
        for document in request.documents {
            std::fs::write(staging.path().join(document.path), document.text)
                .map_err(OverlayError::Staging)?;
        }
        let origin_added = prepare_config(staging.path(), request)?;

        tracing::debug!(staging=%staging.path().display(), "package staged");
        let output = self.run(staging.path(), cancellation)?;
        let output = String::from_utf8(output).map_err(OverlayError::OutputNotUtf8)?;

        split_output(&output, origin_added)
    }
}

/// Copy the package root into `staging`, skipping version control metadata and symlinks
fn stage_package(root: &Path, staging: &Path) -> Result<(), OverlayError> {
    let entries = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git");

    for entry in entries {
        let entry = entry.map_err(|e| OverlayError::Staging(e.into()))?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let destination = staging.join(relative);

        let copied = if file_type.is_dir() {
            std::fs::create_dir_all(&destination)
        } else {
            std::fs::copy(entry.path(), &destination).map(|_| ())
        };
        copied.map_err(OverlayError::Staging)?;
    }

    Ok(())
}

/// Rewrite the staged kustomization for a build of `request`
///
/// Withheld documents are dropped from `resources` and origin annotations are switched on.
/// Without a kustomization one is created listing the request's documents. Returns `true` if
/// origin annotations were not requested by the package itself.
fn prepare_config(staging: &Path, request: &BuildRequest) -> Result<bool, OverlayError> {
    let existing = request
        .overlay_config
        .and_then(|config| config.strip_prefix(request.package_root).ok());

    let (path, mut config) = match existing {
        Some(relative) => {
            let path = staging.join(relative);
            let text = std::fs::read_to_string(&path).map_err(OverlayError::Staging)?;
            let config: serde_yaml::Value =
                serde_yaml::from_str(&text).map_err(|source| OverlayError::Config {
                    path: config_name(&path),
                    source,
                })?;
            (path, config)
        }
        None => {
            let resources = request
                .documents
                .iter()
                .map(|document| resource_name(document.path).into())
                .collect();

            let mut config = serde_yaml::Mapping::new();
            config.insert(
                "apiVersion".into(),
                "kustomize.config.k8s.io/v1beta1".into(),
            );
            config.insert("kind".into(), "Kustomization".into());
            config.insert("resources".into(), serde_yaml::Value::Sequence(resources));
            (
                staging.join(OVERLAY_CONFIG_NAMES[0]),
                serde_yaml::Value::Mapping(config),
            )
        }
    };

    let shape = |reason| OverlayError::ConfigShape {
        path: config_name(&path),
        reason,
    };

    let serde_yaml::Value::Mapping(mapping) = &mut config else {
        return Err(shape("not a mapping"));
    };

    if let Some(resources) = mapping.get_mut("resources") {
        let serde_yaml::Value::Sequence(resources) = resources else {
            return Err(shape("resources is not a list"));
        };
        let withheld = request
            .withheld
            .iter()
            .map(|path| resource_name(path))
            .collect::<Vec<_>>();
        resources.retain(|resource| {
            let name = resource.as_str().map(|name| name.trim_start_matches("./"));
            let keep = name.map_or(true, |name| !withheld.iter().any(|w| w == name));
            if !keep {
                tracing::debug!(?resource, "withheld from overlay");
            }
            keep
        });
    }

    let build_metadata = mapping
        .entry("buildMetadata".into())
        .or_insert_with(|| serde_yaml::Value::Sequence(Vec::new()));
    let serde_yaml::Value::Sequence(options) = build_metadata else {
        return Err(shape("buildMetadata is not a list"));
    };
    let origin_added = !options
        .iter()
        .any(|option| option.as_str() == Some(ORIGIN_ANNOTATIONS));
    if origin_added {
        options.push(ORIGIN_ANNOTATIONS.into());
    }

    let text = serde_yaml::to_string(&config).map_err(|source| OverlayError::Config {
        path: config_name(&path),
        source,
    })?;
    std::fs::write(&path, text).map_err(OverlayError::Staging)?;

    Ok(origin_added)
}

/// Assign every output document to the template it came from
///
/// Documents without an origin path (generated resources) are dropped.
fn split_output(output: &str, strip_origin: bool) -> Result<BuildOutput, OverlayError> {
    let mut split = BuildOutput::default();

    for document in documents(output) {
        let value: serde_yaml::Value =
            serde_yaml::from_str(document).map_err(OverlayError::Output)?;
        let origin = value["metadata"]["annotations"][ORIGIN_ANNOTATION]
            .as_str()
            .and_then(origin_path);

        let Some(path) = origin else {
            tracing::info!(
                kind = ?value["kind"],
                name = ?value["metadata"]["name"],
                "overlay output without a source file, dropped"
            );
            continue;
        };

        if strip_origin {
            split.append(path, &remove_origin(document));
        } else {
            split.append(path, document);
        }
    }

    Ok(split)
}

/// Documents of a YAML stream, separated by `---` lines
fn documents(stream: &str) -> Vec<&str> {
    let mut documents = Vec::new();
    let mut start = 0;
    let mut position = 0;

    for line in stream.split_inclusive('\n') {
        if line.trim_end() == "---" {
            documents.push(&stream[start..position]);
            start = position + line.len();
        }
        position += line.len();
    }
    documents.push(&stream[start..]);

    documents.retain(|document| !document.trim().is_empty());
    documents
}

/// `path` of an origin annotation value
fn origin_path(origin: &str) -> Option<PathBuf> {
    let origin: serde_yaml::Value = serde_yaml::from_str(origin).ok()?;
    let path = origin["path"].as_str()?;

    Some(
        Path::new(path)
            .components()
            .filter(|component| !matches!(component, Component::CurDir))
            .collect(),
    )
}

/// Remove the origin annotation, and `annotations:` if it held nothing else
fn remove_origin(document: &str) -> String {
    let lines = document.split_inclusive('\n').collect::<Vec<_>>();
    let key = format!("{ORIGIN_ANNOTATION}:");

    let Some(start) = lines
        .iter()
        .position(|line| line.trim_start().starts_with(&key))
    else {
        return document.to_string();
    };

    let indent = indentation(lines[start]);
    let end = start
        + 1
        + lines[start + 1..]
            .iter()
            .take_while(|line| line.trim().is_empty() || indentation(line) > indent)
            .count();

    let mut first = start;
    let parent = lines[..start]
        .iter()
        .rposition(|line| !line.trim().is_empty() && indentation(line) < indent);
    if let Some(parent) = parent {
        let alone_before = lines[parent + 1..start]
            .iter()
            .all(|line| line.trim().is_empty());
        let alone_after = lines[end..]
            .iter()
            .find(|line| !line.trim().is_empty())
            .map_or(true, |line| indentation(line) < indent);
        if alone_before && alone_after && lines[parent].trim() == "annotations:" {
            first = parent;
        }
    }

    [&lines[..first], &lines[end..]].concat().concat()
}

fn indentation(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

/// `/` separated resource name of a path relative to the package root
fn resource_name(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn config_name(path: &Path) -> PathBuf {
    path.file_name().map(PathBuf::from).unwrap_or_default()
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<std::io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buffer)?;
        }
        Ok(buffer)
    })
}

fn join(handle: JoinHandle<std::io::Result<Vec<u8>>>) -> Result<Vec<u8>, OverlayError> {
    handle
        .join()
        .map_err(|_| OverlayError::Process(std::io::Error::other("output reader panicked")))?
        .map_err(OverlayError::Process)
}
