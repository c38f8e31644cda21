// Prompt templates and their registry

use crate::protocol::{GetPromptResult, Prompt, PromptArgument, PromptMessage, Role, ToolContent};
use geoscope_core::DispatchError;
use std::collections::HashMap;
use std::sync::Arc;

/// A named prompt template rendered from string arguments
pub trait PromptTemplate: Send + Sync {
    fn descriptor(&self) -> Prompt;

    fn render(&self, arguments: &HashMap<String, String>) -> Result<GetPromptResult, DispatchError>;
}

/// Prompt registry keeping registration order
#[derive(Default, Clone)]
pub struct PromptRegistry {
    prompts: Vec<Arc<dyn PromptTemplate>>,
    by_name: HashMap<String, usize>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, prompt: Arc<dyn PromptTemplate>) -> Result<(), DispatchError> {
        let name = prompt.descriptor().name;
        if self.by_name.contains_key(&name) {
            return Err(DispatchError::Internal(format!(
                "prompt '{}' is already registered",
                name
            )));
        }
        self.by_name.insert(name, self.prompts.len());
        self.prompts.push(prompt);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PromptTemplate>> {
        self.by_name.get(name).map(|&index| self.prompts[index].clone())
    }

    pub fn list(&self) -> Vec<Prompt> {
        self.prompts.iter().map(|p| p.descriptor()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.prompts.iter().map(|p| p.descriptor().name).collect()
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

fn argument(name: &str, description: &str, required: bool) -> PromptArgument {
    PromptArgument {
        name: name.to_string(),
        description: Some(description.to_string()),
        required,
    }
}

/// Check that every required argument of `prompt` is present and non-empty
fn require_arguments(prompt: &Prompt, arguments: &HashMap<String, String>) -> Result<(), DispatchError> {
    let missing: Vec<&str> = prompt
        .arguments
        .iter()
        .filter(|arg| arg.required)
        .filter(|arg| arguments.get(&arg.name).map_or(true, |v| v.trim().is_empty()))
        .map(|arg| arg.name.as_str())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(DispatchError::InvalidParams {
            message: format!(
                "Prompt '{}' is missing required argument(s): {}",
                prompt.name,
                missing.join(", ")
            ),
            data: Some(serde_json::json!({ "prompt": prompt.name, "missing": missing })),
        })
    }
}

fn optional<'a>(arguments: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    arguments
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn user_message(text: String) -> PromptMessage {
    PromptMessage {
        role: Role::User,
        content: ToolContent::Text { text },
    }
}

/// Asks the model to assess one page's visibility in generative engines
pub struct AnalyzePagePrompt;

impl PromptTemplate for AnalyzePagePrompt {
    fn descriptor(&self) -> Prompt {
        Prompt {
            name: "analyze_page".to_string(),
            description: Some(
                "Assess how well a page is positioned to be cited by generative engines".to_string(),
            ),
            arguments: vec![
                argument("url", "Page to analyze", true),
                argument("industry", "Industry the page competes in", false),
                argument("engine", "Generative engine to optimize for", false),
            ],
        }
    }

    fn render(&self, arguments: &HashMap<String, String>) -> Result<GetPromptResult, DispatchError> {
        let descriptor = self.descriptor();
        require_arguments(&descriptor, arguments)?;

        let url = optional(arguments, "url").unwrap_or_default();
        let mut text = format!(
            "Fetch {} with the web_fetch tool and evaluate how likely generative engines are to cite it. \
             Cover factual density, clear answers to likely questions, structure, and source attribution.",
            url
        );
        if let Some(industry) = optional(arguments, "industry") {
            text.push_str(&format!(" Judge it against typical {} content.", industry));
        }
        if let Some(engine) = optional(arguments, "engine") {
            text.push_str(&format!(" Prioritize what {} tends to surface.", engine));
        }
        text.push_str(" Finish with the three changes that would help most.");

        Ok(GetPromptResult {
            description: descriptor.description,
            messages: vec![user_message(text)],
        })
    }
}

/// Asks the model to compare two pages competing for the same queries
pub struct ComparePagesPrompt;

impl PromptTemplate for ComparePagesPrompt {
    fn descriptor(&self) -> Prompt {
        Prompt {
            name: "compare_pages".to_string(),
            description: Some("Compare two pages competing for the same queries".to_string()),
            arguments: vec![
                argument("url", "Your page", true),
                argument("competitor_url", "Competing page", true),
                argument("content_type", "Kind of content being compared", false),
            ],
        }
    }

    fn render(&self, arguments: &HashMap<String, String>) -> Result<GetPromptResult, DispatchError> {
        let descriptor = self.descriptor();
        require_arguments(&descriptor, arguments)?;

        let url = optional(arguments, "url").unwrap_or_default();
        let competitor = optional(arguments, "competitor_url").unwrap_or_default();
        let kind = optional(arguments, "content_type").unwrap_or("page");

        let text = format!(
            "Fetch {} and {} with the web_fetch tool. Compare the two as a {} \
             from the point of view of a generative engine choosing which to cite, \
             and list where the first falls behind.",
            url, competitor, kind
        );

        Ok(GetPromptResult {
            description: descriptor.description,
            messages: vec![user_message(text)],
        })
    }
}
