//! # kelp - overlay templated manifests
//!
//! `kelp` runs a structural overlay engine (kustomize) over a chart whose manifests contain
//! template expressions, and hands back manifests that still contain those expressions.
//!
//! ## Introduction for developers
//!
//! Read this to understand how `kelp` works internally.
//!
//! ### The problem
//!
//! Overlay engines only accept valid YAML. Templated manifests usually are not:
//!
//! ```yaml
//! metadata:
//!   name: {{ .Release.Name }}-web
//! ```
//!
//! `{{` starts a flow mapping in YAML and `-web` after its end is a syntax error.
//!
//! ### Pipeline
//!
//! see [pipeline::Pipeline]
//!
//! Each templated manifest goes through three stages.
//!
//! 1. **Escape** ([document::escape]) quotes every plain scalar containing an expression:
//!    `name: "{{ .Release.Name }}-web"`. The document is now valid YAML.
//! 2. **Overlay** ([overlay::OverlayInvoker]) hands all escaped documents to the engine in one
//!    build and splits the output back into one text per template.
//! 3. **Restore** ([document::restore]) removes the quotes added in step 1.
//!
//! Without an overlay in between, restore is the exact inverse of escape.
//!
//! ### Scanning
//!
//! [scanner::Lexer] makes one pass over a line and reports expression spans as well as plain
//! and quoted scalars. Expressions already inside a quoted scalar are left alone, as are
//! comments and the bodies of block scalars.
//!
//! ### Telling added quotes from hand-written ones
//!
//! `a: "{{ .x }}"` might have been written that way or produced by escaping `a: {{ .x }}`.
//! Escaping records every quoted scalar that contains an expression in a [transcode::Ledger]
//! together with its origin. Restore walks the (possibly re-quoted) overlay output and
//! consumes ledger marks by value:
//!
//! | **source line**        | **escaped**            | **mark**                     | **restored**           |
//! |------------------------|------------------------|------------------------------|------------------------|
//! | `a: "{{ .x }}"`        | `a: "{{ .x }}"`        | `{{ .x }}`, original         | `a: "{{ .x }}"`        |
//! | `b: {{ .x }}`          | `b: "{{ .x }}"`        | `{{ .x }}`, added            | `b: {{ .x }}`          |
//! | `c: web-{{ .x }}`      | `c: "web-{{ .x }}"`    | `web-{{ .x }}`, added        | `c: web-{{ .x }}`      |
//! | `d: "{{ f "x" }}"`     | `d: "{{ f \"x\" }}"`   | source text, requoted        | `d: "{{ f "x" }}"`     |
//!
//! Added marks that never show up in the output are reported as
//! [transcode::RestoreMismatch] warnings.
//!
//! ### Errors
//!
//! Problems with a single manifest ([pipeline::DocumentError]) fail that manifest only. The
//! run continues and reports a [pipeline::RunSummary]. Problems with the package itself or
//! with writing output ([pipeline::RunError]) end the run.
//!
pub mod cancel;
pub mod document;
pub mod overlay;
pub mod package;
pub mod pipeline;
pub mod scanner;
pub mod sink;
pub mod transcode;
