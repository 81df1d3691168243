use super::{BuildOutput, BuildRequest, OverlayEngine, OverlayError};
use crate::cancel::Cancellation;
use serde::Deserialize;

/// Engine that applies no overlay
///
/// Checks that each escaped document is valid YAML and returns it unchanged, which makes a run
/// a verification of escape and restore on a real package.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl OverlayEngine for Passthrough {
    fn name(&self) -> &'static str {
        "none"
    }

    fn build(
        &self,
        request: &BuildRequest,
        cancellation: &Cancellation,
    ) -> Result<BuildOutput, OverlayError> {
        let mut output = BuildOutput::default();

        for document in request.documents {
            if cancellation.is_cancelled() {
                return Err(OverlayError::Cancelled);
            }

            let checked = validate(document.text).map(|()| document.text.to_string());
            output.insert(document.path, checked);
        }

        Ok(output)
    }
}

fn validate(text: &str) -> Result<(), OverlayError> {
    for document in serde_yaml::Deserializer::from_str(text) {
        serde_yaml::Value::deserialize(document).map_err(|e| OverlayError::Engine {
            message: e.to_string(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::overlay::BuildDocument;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    #[test]
    fn documents_are_checked_one_by_one() {
        let documents = [
            BuildDocument::new(Path::new("a.yaml"), "a: \"{{ .a }}\"\n---\nb: [1, 2]\n"),
            BuildDocument::new(Path::new("b.yaml"), "a: b: c\n"),
        ];
        let request = BuildRequest::new(Path::new("/package"), None, &documents, &[]);

        let mut output = Passthrough.build(&request, &Cancellation::new()).unwrap();

        assert_eq!(
            output.take(Path::new("a.yaml")).unwrap(),
            "a: \"{{ .a }}\"\n---\nb: [1, 2]\n"
        );
        assert!(matches!(
            output.take(Path::new("b.yaml")),
            Err(OverlayError::Engine { .. })
        ));
    }

    #[test]
    fn cancelled() {
        let documents = [BuildDocument::new(Path::new("a.yaml"), "a: 1\n")];
        let request = BuildRequest::new(Path::new("/package"), None, &documents, &[]);
        let cancellation = Cancellation::new();
        cancellation.cancel();

        assert!(matches!(
            Passthrough.build(&request, &cancellation),
            Err(OverlayError::Cancelled)
        ));
    }
}
