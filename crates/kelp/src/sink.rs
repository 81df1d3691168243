//! output sinks for restored manifests
use std::io::Write;
use std::path::{Path, PathBuf};

pub trait OutputSink {
    /// Write a restored templated manifest
    fn emit(&mut self, relative: &Path, contents: &str) -> std::io::Result<()>;

    /// Pass a file that is not a templated manifest through unchanged
    fn copy(&mut self, relative: &Path, source: &Path) -> std::io::Result<()>;
}

/// Writes all manifests into one stream, each introduced by `---` and a `# Source:` comment
///
/// Files that are not templated manifests are skipped.
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: W,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> OutputSink for WriterSink<W> {
    fn emit(&mut self, relative: &Path, contents: &str) -> std::io::Result<()> {
        writeln!(self.writer, "---")?;
        writeln!(self.writer, "# Source: {}", source_name(relative))?;
        self.writer.write_all(contents.as_bytes())?;
        if !contents.is_empty() && !contents.ends_with('\n') {
            writeln!(self.writer)?;
        }
        self.writer.flush()
    }

    fn copy(&mut self, relative: &Path, _source: &Path) -> std::io::Result<()> {
        tracing::debug!(path=%relative.display(), "not a templated manifest, skipped");
        Ok(())
    }
}

/// Mirrors the package layout below a destination directory
#[derive(Debug)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn destination(&self, relative: &Path) -> std::io::Result<PathBuf> {
        let destination = self.root.join(relative);
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(destination)
    }
}

impl OutputSink for DirectorySink {
    fn emit(&mut self, relative: &Path, contents: &str) -> std::io::Result<()> {
        let destination = self.destination(relative)?;
        tracing::info!(path=%destination.display(), "writing manifest");
        std::fs::write(destination, contents)
    }

    fn copy(&mut self, relative: &Path, source: &Path) -> std::io::Result<()> {
        let destination = self.destination(relative)?;
        tracing::info!(path=%destination.display(), "copying file");
        std::fs::copy(source, destination).map(|_| ())
    }
}

/// `/` separated on every platform
fn source_name(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn writer_sink_separates_documents() {
        let mut sink = WriterSink::new(Vec::new());
        sink.emit(Path::new("templates/a.yaml"), "a: {{ .a }}").unwrap();
        sink.copy(Path::new("templates/NOTES.txt"), Path::new("unused")).unwrap();
        sink.emit(Path::new("templates/b.yaml"), "b: 1\n").unwrap();

        assert_eq!(
            String::from_utf8(sink.into_inner()).unwrap(),
            "---\n# Source: templates/a.yaml\na: {{ .a }}\n---\n# Source: templates/b.yaml\nb: 1\n"
        );
    }

    #[test]
    fn directory_sink_mirrors_layout() {
        let source = tempfile::tempdir().unwrap();
        let destination = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("NOTES.txt"), "notes").unwrap();

        let mut sink = DirectorySink::new(destination.path());
        sink.emit(Path::new("templates/sub/a.yaml"), "a: 1").unwrap();
        sink.copy(
            Path::new("templates/NOTES.txt"),
            &source.path().join("NOTES.txt"),
        )
        .unwrap();

        assert_eq!(
            std::fs::read_to_string(destination.path().join("templates/sub/a.yaml")).unwrap(),
            "a: 1"
        );
        assert_eq!(
            std::fs::read_to_string(destination.path().join("templates/NOTES.txt")).unwrap(),
            "notes"
        );
    }
}
