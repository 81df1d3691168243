//! pipeline orchestration
//!
//! Every templated manifest of a package moves through
//!
//! ```text
//! Raw -> Escaped -> Overlaid -> Restored -> Emitted
//! ```
//!
//! one stage at a time. All documents are escaped first, the package is built by the overlay
//! engine once, and the output is restored document by document. A failing stage ends in
//! `Failed` for that document only. Cancellation is checked between stages and leaves documents
//! `Cancelled`.
//!
//! Errors that prevent the run itself (listing the package, reading a file, writing output)
//! abort with a [RunError].
use crate::cancel::Cancellation;
use crate::document::{self, EscapeError, EscapedDocument, RestoredDocument, TemplateDocument};
use crate::overlay::{BuildDocument, OverlayError, OverlayInvoker};
use crate::package::{Package, PackageError, PackageFile};
use crate::sink::OutputSink;
use crate::transcode::{Ledger, RestoreMismatch, Transcoder};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Raw,
    Escaped,
    Overlaid,
    Restored,
    Emitted,
}

/// Why a single document failed
#[derive(thiserror::Error, Debug)]
pub enum DocumentError {
    #[error(transparent)]
    UnterminatedExpression(#[from] EscapeError),
    #[error("template is not valid UTF-8")]
    TemplateNotUtf8(#[source] std::string::FromUtf8Error),
    /// shared by every document of a failed build
    #[error(transparent)]
    OverlayEngine(Arc<OverlayError>),
}

impl From<OverlayError> for DocumentError {
    fn from(error: OverlayError) -> Self {
        DocumentError::OverlayEngine(Arc::new(error))
    }
}

/// Failures that end the whole run
#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error("unable to read {}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to write output for {}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Emitted {
        #[serde(skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<RestoreMismatch>,
    },
    /// not a templated manifest, passed to the sink unchanged
    Copied,
    Failed {
        /// last stage the document reached
        stage: Stage,
        #[serde(serialize_with = "serialize_error")]
        error: DocumentError,
    },
    Cancelled {
        /// last stage the document reached
        stage: Stage,
    },
}

#[derive(Debug, serde::Serialize)]
pub struct DocumentReport {
    pub path: PathBuf,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct RunSummary {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub documents: Vec<DocumentReport>,
}

impl RunSummary {
    fn record(&mut self, report: DocumentReport) {
        match &report.outcome {
            Outcome::Emitted { .. } => self.processed += 1,
            Outcome::Copied => self.skipped += 1,
            Outcome::Failed { stage, error } => {
                tracing::warn!(path=%report.path.display(), ?stage, %error, "document failed");
                self.failed += 1
            }
            Outcome::Cancelled { .. } => self.cancelled += 1,
        }
        self.documents.push(report);
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

enum DocumentState {
    Raw(TemplateDocument),
    Escaped(EscapedDocument),
    Overlaid { output: String, ledger: Ledger },
    Restored(RestoredDocument),
    Emitted(Vec<RestoreMismatch>),
    Copied,
    Failed { stage: Stage, error: DocumentError },
    Cancelled { stage: Stage },
}

impl DocumentState {
    fn stage(&self) -> Stage {
        match self {
            DocumentState::Raw(_) | DocumentState::Copied => Stage::Raw,
            DocumentState::Escaped(_) => Stage::Escaped,
            DocumentState::Overlaid { .. } => Stage::Overlaid,
            DocumentState::Restored(_) => Stage::Restored,
            DocumentState::Emitted(_) => Stage::Emitted,
            DocumentState::Failed { stage, .. } | DocumentState::Cancelled { stage } => *stage,
        }
    }

    /// Documents that did not reach a final state count as cancelled
    fn into_outcome(self) -> Outcome {
        match self {
            DocumentState::Emitted(warnings) => Outcome::Emitted { warnings },
            DocumentState::Copied => Outcome::Copied,
            DocumentState::Failed { stage, error } => Outcome::Failed { stage, error },
            state => Outcome::Cancelled {
                stage: state.stage(),
            },
        }
    }
}

#[derive(Debug)]
pub struct Pipeline {
    transcoder: Transcoder,
    invoker: OverlayInvoker,
}

impl Pipeline {
    pub fn new(transcoder: Transcoder, invoker: OverlayInvoker) -> Self {
        Self {
            transcoder,
            invoker,
        }
    }

    /// Escape every template, build the package once, then restore and emit in file order
    pub fn run(
        &self,
        package: &Package,
        sink: &mut dyn OutputSink,
        cancellation: &Cancellation,
    ) -> Result<RunSummary, RunError> {
        let files = package.files()?;
        tracing::info!(
            root = %package.root().display(),
            engine = self.invoker.engine_name(),
            files = files.len(),
            "run started"
        );

        let mut states = Vec::with_capacity(files.len());
        for file in &files {
            let state = if file.templated {
                let state = self.read(file)?;
                self.advance(state, file, sink, cancellation)?
            } else {
                self.copy(file, sink, cancellation)?
            };
            states.push(state);
        }

        let states = self.overlay(package, &files, states, cancellation);

        let mut summary = RunSummary::default();
        for (file, state) in files.into_iter().zip(states) {
            let state = self.advance(state, &file, sink, cancellation)?;
            summary.record(DocumentReport {
                path: file.relative,
                outcome: state.into_outcome(),
            });
        }

        tracing::info!(
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "run finished"
        );
        Ok(summary)
    }

    fn copy(
        &self,
        file: &PackageFile,
        sink: &mut dyn OutputSink,
        cancellation: &Cancellation,
    ) -> Result<DocumentState, RunError> {
        if cancellation.is_cancelled() {
            return Ok(DocumentState::Cancelled { stage: Stage::Raw });
        }

        sink.copy(&file.relative, &file.path)
            .map_err(|source| RunError::Write {
                path: file.relative.clone(),
                source,
            })?;
        Ok(DocumentState::Copied)
    }

    fn read(&self, file: &PackageFile) -> Result<DocumentState, RunError> {
        let bytes = std::fs::read(&file.path).map_err(|source| RunError::Read {
            path: file.path.clone(),
            source,
        })?;

        Ok(match String::from_utf8(bytes) {
            Ok(text) => DocumentState::Raw(TemplateDocument::new(text)),
            Err(e) => DocumentState::Failed {
                stage: Stage::Raw,
                error: DocumentError::TemplateNotUtf8(e),
            },
        })
    }

    /// Step `state` until it is final or waits for the overlay build
    #[tracing::instrument(level = "debug", skip_all, fields(document = %file.relative.display()))]
    fn advance(
        &self,
        mut state: DocumentState,
        file: &PackageFile,
        sink: &mut dyn OutputSink,
        cancellation: &Cancellation,
    ) -> Result<DocumentState, RunError> {
        loop {
            state = match state {
                state @ (DocumentState::Escaped(_)
                | DocumentState::Emitted(_)
                | DocumentState::Copied
                | DocumentState::Failed { .. }
                | DocumentState::Cancelled { .. }) => return Ok(state),
                state if cancellation.is_cancelled() => DocumentState::Cancelled {
                    stage: state.stage(),
                },
                state => {
                    let from = state.stage();
                    let next = self.step(state, file, sink)?;
                    tracing::debug!(?from, to = ?next.stage(), "transition");
                    next
                }
            };
        }
    }

    fn step(
        &self,
        state: DocumentState,
        file: &PackageFile,
        sink: &mut dyn OutputSink,
    ) -> Result<DocumentState, RunError> {
        let next = match state {
            DocumentState::Raw(template) => match document::escape(&template, &self.transcoder) {
                Ok(escaped) => DocumentState::Escaped(escaped),
                Err(error) => DocumentState::Failed {
                    stage: Stage::Raw,
                    error: error.into(),
                },
            },
            DocumentState::Overlaid { output, ledger } => {
                DocumentState::Restored(document::restore(&output, &ledger, &self.transcoder))
            }
            DocumentState::Restored(restored) => {
                sink.emit(&file.relative, &restored.text)
                    .map_err(|source| RunError::Write {
                        path: file.relative.clone(),
                        source,
                    })?;
                DocumentState::Emitted(restored.mismatches)
            }
            state => state,
        };

        Ok(next)
    }

    /// Run one overlay build for all escaped documents
    ///
    /// Templates that failed before are withheld from the build. A failing build fails every
    /// document that took part in it.
    fn overlay(
        &self,
        package: &Package,
        files: &[PackageFile],
        states: Vec<DocumentState>,
        cancellation: &Cancellation,
    ) -> Vec<DocumentState> {
        if !states
            .iter()
            .any(|state| matches!(state, DocumentState::Escaped(_)))
        {
            return states;
        }

        let mut output = {
            let documents = files
                .iter()
                .zip(&states)
                .filter_map(|(file, state)| match state {
                    DocumentState::Escaped(escaped) => {
                        Some(BuildDocument::new(&file.relative, escaped.text()))
                    }
                    _ => None,
                })
                .collect::<Vec<_>>();
            let withheld = files
                .iter()
                .zip(&states)
                .filter(|(file, state)| {
                    file.templated && !matches!(state, DocumentState::Escaped(_))
                })
                .map(|(file, _)| file.relative.as_path())
                .collect::<Vec<_>>();

            self.invoker
                .invoke(package, &documents, &withheld, cancellation)
                .map_err(Arc::new)
        };

        let states = files
            .iter()
            .zip(states)
            .map(|(file, state)| {
                let escaped = match state {
                    DocumentState::Escaped(escaped) => escaped,
                    state => return state,
                };

                let result = match &mut output {
                    Ok(output) => output.take(&file.relative).map_err(Arc::new),
                    Err(error) => Err(Arc::clone(error)),
                };
                match result {
                    Ok(output) => DocumentState::Overlaid {
                        output,
                        ledger: escaped.into_ledger(),
                    },
                    Err(error) if matches!(*error, OverlayError::Cancelled) => {
                        DocumentState::Cancelled {
                            stage: Stage::Escaped,
                        }
                    }
                    Err(error) => DocumentState::Failed {
                        stage: Stage::Escaped,
                        error: DocumentError::OverlayEngine(error),
                    },
                }
            })
            .collect::<Vec<_>>();

        if let Ok(output) = &output {
            for path in output.paths() {
                tracing::warn!(path = %path.display(), "overlay output for an unknown file");
            }
        }

        states
    }
}

fn serialize_error<S: serde::Serializer>(
    error: &DocumentError,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}
