// Argument autocompletion

use crate::protocol::{CompleteParams, CompletionValues, ReferenceKind};
use std::collections::HashMap;

/// Maximum number of values returned for one completion request
pub const MAX_COMPLETIONS: usize = 10;

/// Fixed vocabularies keyed by argument name
#[derive(Debug, Clone)]
pub struct Vocabulary {
    terms: HashMap<String, Vec<String>>,
}

impl Vocabulary {
    pub fn empty() -> Self {
        Self {
            terms: HashMap::new(),
        }
    }

    pub fn with_terms(mut self, argument: impl Into<String>, terms: &[&str]) -> Self {
        self.insert(argument, terms.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn insert(&mut self, argument: impl Into<String>, terms: Vec<String>) {
        self.terms.insert(argument.into(), terms);
    }

    pub fn get(&self, argument: &str) -> Option<&[String]> {
        self.terms.get(argument).map(Vec::as_slice)
    }
}

impl Default for Vocabulary {
    /// Vocabulary for the GEO analysis domain
    fn default() -> Self {
        Self::empty()
            .with_terms(
                "industry",
                &[
                    "automotive",
                    "b2b-saas",
                    "ecommerce",
                    "education",
                    "finance",
                    "fintech",
                    "healthcare",
                    "hospitality",
                    "insurance",
                    "legal",
                    "manufacturing",
                    "media",
                    "real-estate",
                    "retail",
                    "travel",
                ],
            )
            .with_terms(
                "content_type",
                &[
                    "article",
                    "blog-post",
                    "case-study",
                    "documentation",
                    "faq",
                    "glossary",
                    "how-to",
                    "landing-page",
                    "listicle",
                    "news",
                    "product-page",
                    "review",
                    "whitepaper",
                ],
            )
            .with_terms(
                "language",
                &["de", "en", "es", "fr", "it", "ja", "ko", "nl", "pt", "zh"],
            )
            .with_terms(
                "engine",
                &["chatgpt", "claude", "copilot", "gemini", "perplexity"],
            )
    }
}

/// Names the completion sources can draw from, snapshotted from the registries
pub struct CompletionSources<'a> {
    pub resources: &'a [String],
    pub prompts: &'a [String],
    pub tools: &'a [String],
    pub vocabulary: &'a Vocabulary,
}

impl CompletionSources<'_> {
    fn candidates(&self, kind: ReferenceKind, argument: &str) -> &[String] {
        let registered = match (kind, argument) {
            (ReferenceKind::Resource, "uri") => Some(self.resources),
            (ReferenceKind::Prompt, "name") => Some(self.prompts),
            (ReferenceKind::Tool, "name") => Some(self.tools),
            (ReferenceKind::Unknown, _) => return &[],
            _ => None,
        };

        registered
            .or_else(|| self.vocabulary.get(argument))
            .unwrap_or(&[])
    }
}

/// Case-insensitive substring filter over the candidate list for the
/// reference kind and argument, capped at [`MAX_COMPLETIONS`].
pub fn complete(params: &CompleteParams, sources: &CompletionSources<'_>) -> CompletionValues {
    let needle = params.argument.value.to_lowercase();
    let matches: Vec<&String> = sources
        .candidates(params.reference.kind, &params.argument.name)
        .iter()
        .filter(|candidate| candidate.to_lowercase().contains(&needle))
        .collect();

    let total = matches.len();
    CompletionValues {
        values: matches
            .into_iter()
            .take(MAX_COMPLETIONS)
            .cloned()
            .collect(),
        total,
        has_more: total > MAX_COMPLETIONS,
    }
}
