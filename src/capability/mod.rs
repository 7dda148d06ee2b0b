//! External capabilities consumed by the pipeline.
//!
//! `Transformer` rewrites a document for one pass (an LLM in production).
//! `Evaluator` runs the rule engine over content. Both are trait objects so the
//! orchestrator can be driven by scripted doubles in tests.

pub mod command;

use async_trait::async_trait;

use crate::document::Document;
use crate::errors::TransformError;
use crate::pass::PassDefinition;
use crate::snapshot::RuleResults;

pub use command::{CommandEvaluator, CommandTransformer};

/// Input for a single transformation call.
#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub job_id: String,
    pub pass_number: u32,
    pub pass_name: String,
    pub instructions: String,
    /// Rendered markdown of the current document
    pub document: String,
}

impl TransformRequest {
    pub fn new(job_id: &str, pass: &PassDefinition, document: &Document) -> Self {
        Self {
            job_id: job_id.to_string(),
            pass_number: pass.number,
            pass_name: pass.name.clone(),
            instructions: pass.instructions.clone(),
            document: document.render(),
        }
    }

    /// Full prompt text handed to a text-in/text-out model.
    pub fn prompt(&self) -> String {
        format!(
            r#"You are running pass {number} ({name}) of a multi-pass content pipeline.

## INSTRUCTIONS
{instructions}

## RULES
1. Keep every `## ` heading that should survive; sections are tracked by heading.
2. Return the complete document, not a diff or a summary.
3. Wrap the returned document in document tags.

## DOCUMENT
<document>
{document}
</document>
"#,
            number = self.pass_number,
            name = self.pass_name,
            instructions = self.instructions,
            document = self.document,
        )
    }
}

/// Content transformation capability.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Return the transformed document text.
    async fn transform(&self, request: &TransformRequest) -> Result<String, TransformError>;
}

/// Rule evaluation capability. Must be a pure function of `content`.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, content: &str) -> anyhow::Result<RuleResults>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::extract_document;

    #[test]
    fn test_prompt_contains_pass_and_document() {
        let pass = PassDefinition::new(3, "Lists", "Use bullet lists.");
        let doc = Document::parse("Intro\n\n## Gear\n\nboots, socks, poles");
        let request = TransformRequest::new("job-1", &pass, &doc);
        let prompt = request.prompt();

        assert!(prompt.contains("pass 3 (Lists)"));
        assert!(prompt.contains("Use bullet lists."));
        assert!(prompt.contains("## Gear"));
    }

    #[test]
    fn test_echoed_prompt_yields_original_document() {
        let pass = PassDefinition::new(1, "Draft", "write");
        let doc = Document::parse("Intro\n\n## Gear\n\nboots");
        let prompt = TransformRequest::new("job-1", &pass, &doc).prompt();
        assert_eq!(Document::parse(extract_document(&prompt)), doc);
    }
}
