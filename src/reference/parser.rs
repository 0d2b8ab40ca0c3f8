//! Pluggable reference parsing
//!
//! The registry tries each parser in order. A parser that does not recognize
//! the input returns `Ok(None)`; one that recognizes it but finds it
//! malformed returns the error, which is reported immediately. When nothing
//! matches, the help text of every parser is aggregated into the error.

use super::{DirReference, GitReference, OciReference, Reference, StreamReference};
use crate::error::{PorchError, Result};

/// Reserved input naming the process stream
pub const STREAM_INPUT: &str = "-";

/// Handles available to stream references
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    pub reader: Option<StreamReference>,
    pub writer: Option<StreamReference>,
}

impl ParseOptions {
    pub fn with_reader(mut self, reader: StreamReference) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn with_writer(mut self, writer: StreamReference) -> Self {
        self.writer = Some(writer);
        self
    }
}

/// One way of turning a string into a [`Reference`]
pub trait ReferenceParser: Send + Sync {
    /// Short name used in diagnostics
    fn name(&self) -> &'static str;

    /// Accepted syntax, shown when no parser matches
    fn help(&self) -> &'static str;

    fn parse(&self, input: &str, options: &ParseOptions) -> Result<Option<Reference>>;
}

/// `-` with a reader and/or writer supplied
pub struct StreamParser;

impl ReferenceParser for StreamParser {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn help(&self) -> &'static str {
        "'-' reads from or writes to the process stream"
    }

    fn parse(&self, input: &str, options: &ParseOptions) -> Result<Option<Reference>> {
        if input.trim() != STREAM_INPUT {
            return Ok(None);
        }
        let reference = match (&options.reader, &options.writer) {
            (Some(r), Some(w)) => Reference::DuplexStream(StreamReference {
                reader: r.reader.clone(),
                writer: w.writer.clone(),
            }),
            (Some(r), None) => Reference::InputStream(r.clone()),
            (None, Some(w)) => Reference::OutputStream(w.clone()),
            (None, None) => return Ok(None),
        };
        Ok(Some(reference))
    }
}

/// `oci://<image>[:<tag>|@<digest>][//<directory>]`
pub struct OciParser;

impl ReferenceParser for OciParser {
    fn name(&self) -> &'static str {
        "oci"
    }

    fn help(&self) -> &'static str {
        "oci://<registry>/<image>[:<tag>|@sha256:<digest>][//<directory>]"
    }

    fn parse(&self, input: &str, _options: &ParseOptions) -> Result<Option<Reference>> {
        Ok(OciReference::parse(input)?.map(Reference::Oci))
    }
}

/// `<repo>.git[/<directory>][@<ref>]`
pub struct GitParser;

impl ReferenceParser for GitParser {
    fn name(&self) -> &'static str {
        "git"
    }

    fn help(&self) -> &'static str {
        "<https|ssh|file URL>.git[/<directory>][@<ref>] or git@<host>:<path>.git[/<directory>][@<ref>]"
    }

    fn parse(&self, input: &str, _options: &ParseOptions) -> Result<Option<Reference>> {
        Ok(GitReference::parse(input)?.map(Reference::Git))
    }
}

/// Local directories
pub struct DirParser;

impl ReferenceParser for DirParser {
    fn name(&self) -> &'static str {
        "dir"
    }

    fn help(&self) -> &'static str {
        "./<path>, ../<path>, /<absolute path> or file://<path>"
    }

    fn parse(&self, input: &str, _options: &ParseOptions) -> Result<Option<Reference>> {
        Ok(DirReference::parse(input).map(Reference::Dir))
    }
}

/// Ordered list of parsers
pub struct ParserRegistry {
    parsers: Vec<Box<dyn ReferenceParser>>,
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self {
            parsers: vec![
                Box::new(StreamParser),
                Box::new(OciParser),
                Box::new(GitParser),
                Box::new(DirParser),
            ],
        }
    }
}

impl ParserRegistry {
    /// Registry without any parser
    pub fn empty() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    /// Append a parser; it is tried after the existing ones
    pub fn register(&mut self, parser: Box<dyn ReferenceParser>) {
        self.parsers.push(parser);
    }

    pub fn parse(&self, input: &str) -> Result<Reference> {
        self.parse_with(input, &ParseOptions::default())
    }

    pub fn parse_with(&self, input: &str, options: &ParseOptions) -> Result<Reference> {
        for parser in &self.parsers {
            if let Some(reference) = parser.parse(input, options)? {
                tracing::trace!(parser = parser.name(), input, "parsed reference");
                return Ok(reference);
            }
        }
        Err(PorchError::ReferenceParseFailed {
            input: input.to_string(),
            reason: format!("no parser matched; expected one of: {}", self.help()),
        })
    }

    /// Aggregate help of all parsers
    pub fn help(&self) -> String {
        self.parsers
            .iter()
            .map(|p| format!("[{}] {}", p.name(), p.help()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceType;
    use proptest::prelude::*;

    #[test]
    fn test_parses_each_kind() {
        let registry = ParserRegistry::default();
        let git = registry.parse("https://github.com/org/repo.git/pkg@v1").unwrap();
        assert_eq!(git.reference_type(), ReferenceType::Git);
        let oci = registry.parse("oci://ghcr.io/org/pkg:v1").unwrap();
        assert_eq!(oci.reference_type(), ReferenceType::Oci);
        let dir = registry.parse("./local/pkg").unwrap();
        assert_eq!(dir.reference_type(), ReferenceType::Dir);
    }

    #[test]
    fn test_dash_requires_stream_option() {
        let registry = ParserRegistry::default();
        let err = registry.parse("-").unwrap_err();
        assert!(err.to_string().contains("-"));

        let options = ParseOptions::default().with_reader(StreamReference::reader(std::io::empty()));
        assert!(matches!(
            registry.parse_with("-", &options).unwrap(),
            Reference::InputStream(_)
        ));

        let options = ParseOptions::default().with_writer(StreamReference::writer(std::io::sink()));
        assert!(matches!(
            registry.parse_with("-", &options).unwrap(),
            Reference::OutputStream(_)
        ));
    }

    #[test]
    fn test_duplex_when_both_supplied() {
        let registry = ParserRegistry::default();
        let options = ParseOptions::default()
            .with_reader(StreamReference::reader(std::io::empty()))
            .with_writer(StreamReference::writer(std::io::sink()));
        let reference = registry.parse_with("-", &options).unwrap();
        assert!(matches!(reference, Reference::DuplexStream(_)));
        assert!(reference.validate().is_ok());
    }

    #[test]
    fn test_no_match_aggregates_help() {
        let registry = ParserRegistry::default();
        let err = registry.parse("not a reference").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("no parser matched"));
    }

    #[test]
    fn test_recognized_but_malformed_reports_parser_error() {
        let registry = ParserRegistry::default();
        let err = registry.parse("https://example.com/org/repo/pkg").unwrap_err();
        assert!(err.to_string().contains(".git"));
    }

    #[test]
    fn test_empty_registry_matches_nothing() {
        let registry = ParserRegistry::empty();
        assert!(registry.parse("./pkg").is_err());
    }

    fn arb_segments(max: usize) -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z][a-z0-9_-]{0,6}", 0..max).prop_map(|segments| segments.join("/"))
    }

    fn arb_git() -> impl Strategy<Value = String> {
        (
            prop_oneof![Just("https://"), Just("ssh://"), Just("file:///srv/")],
            "[a-z]{1,8}\\.(com|io)",
            "[a-z][a-z0-9-]{0,8}",
            arb_segments(4),
            prop::option::of("[a-z0-9][a-z0-9._-]{0,10}"),
            any::<bool>(),
        )
            .prop_map(|(scheme, host, repo, directory, git_ref, trailing_slash)| {
                let mut input = format!("{scheme}{host}/{repo}.git");
                if !directory.is_empty() {
                    input.push('/');
                    input.push_str(&directory);
                    if trailing_slash {
                        input.push('/');
                    }
                }
                if let Some(git_ref) = git_ref {
                    input.push('@');
                    input.push_str(&git_ref);
                }
                input
            })
    }

    fn arb_oci() -> impl Strategy<Value = String> {
        (
            "[a-z]{1,8}\\.io(:[0-9]{2,4})?",
            "[a-z][a-z0-9-]{0,8}(/[a-z][a-z0-9-]{0,8}){0,2}",
            prop_oneof![
                Just(String::new()),
                "[a-z0-9][a-z0-9._-]{0,8}".prop_map(|tag| format!(":{tag}")),
                "[0-9a-f]{64}".prop_map(|hex| format!("@sha256:{hex}")),
            ],
            arb_segments(3),
        )
            .prop_map(|(registry, path, version, directory)| {
                let mut input = format!("oci://{registry}/{path}{version}");
                if !directory.is_empty() {
                    input.push_str("//");
                    input.push_str(&directory);
                }
                input
            })
    }

    fn arb_absolute_dir() -> impl Strategy<Value = String> {
        arb_segments(5).prop_map(|path| format!("/{path}"))
    }

    proptest! {
        #[test]
        fn test_reference_string_form_parses_back(input in prop_oneof![arb_git(), arb_oci(), arb_absolute_dir()]) {
            let registry = ParserRegistry::default();
            let parsed = registry.parse(&input).unwrap();
            let rendered = parsed.to_string();
            let reparsed = registry.parse(&rendered).unwrap();
            prop_assert_eq!(&reparsed, &parsed);
            prop_assert_eq!(reparsed.to_string(), rendered);
        }
    }
}
