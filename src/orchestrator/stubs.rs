//! Deterministic transformer and evaluator doubles for orchestrator tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::capability::{Evaluator, TransformRequest, Transformer};
use crate::document::Document;
use crate::errors::TransformError;
use crate::snapshot::{RuleResult, RuleResults};

/// Rule `X` passes iff the content contains the marker `[X]`.
pub struct MarkerEvaluator {
    rules: Vec<String>,
    fail_on: Option<String>,
    pub calls: AtomicU32,
}

impl MarkerEvaluator {
    pub fn new(rules: &[&str]) -> Self {
        Self {
            rules: rules.iter().map(|r| r.to_string()).collect(),
            fail_on: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Fail any evaluation of content containing `marker`.
    pub fn failing_on(mut self, marker: &str) -> Self {
        self.fail_on = Some(marker.to_string());
        self
    }
}

#[async_trait]
impl Evaluator for MarkerEvaluator {
    async fn evaluate(&self, content: &str) -> anyhow::Result<RuleResults> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.fail_on
            && content.contains(marker.as_str())
        {
            anyhow::bail!("rule engine crashed on '{}'", marker);
        }
        Ok(self
            .rules
            .iter()
            .map(|id| {
                let result = if content.contains(&format!("[{}]", id)) {
                    RuleResult::pass("marker present")
                } else {
                    RuleResult::fail("marker missing")
                };
                (id.clone(), result)
            })
            .collect())
    }
}

/// Edit applied to one section by one pass.
#[derive(Debug, Clone, Default)]
pub struct Edit {
    pub section: String,
    pub add: Vec<String>,
    pub remove: Vec<String>,
    pub append: Option<String>,
}

impl Edit {
    pub fn on(section: &str) -> Self {
        Self {
            section: section.to_string(),
            ..Self::default()
        }
    }

    pub fn add(mut self, rules: &[&str]) -> Self {
        self.add.extend(rules.iter().map(|r| r.to_string()));
        self
    }

    pub fn remove(mut self, rules: &[&str]) -> Self {
        self.remove.extend(rules.iter().map(|r| r.to_string()));
        self
    }

    pub fn append(mut self, text: &str) -> Self {
        self.append = Some(text.to_string());
        self
    }

    fn apply(&self, document: &mut Document) {
        let Some(section) = document
            .sections
            .iter_mut()
            .find(|s| s.key == self.section)
        else {
            return;
        };
        for rule in &self.remove {
            section.body = section.body.replace(&format!(" [{}]", rule), "");
            section.body = section.body.replace(&format!("[{}]", rule), "");
        }
        for rule in &self.add {
            section.body.push_str(&format!(" [{}]", rule));
        }
        if let Some(text) = &self.append {
            section.body.push_str(text);
        }
    }
}

/// Applies a fixed edit per pass number; passes without an edit return the
/// document unchanged. Queued errors are returned first, one per call.
#[derive(Default)]
pub struct ScriptedTransformer {
    edits: BTreeMap<u32, Edit>,
    failures: Mutex<VecDeque<TransformError>>,
    pub calls: AtomicU32,
}

impl ScriptedTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_edit(mut self, pass: u32, edit: Edit) -> Self {
        self.edits.insert(pass, edit);
        self
    }

    pub fn with_failures(self, failures: Vec<TransformError>) -> Self {
        *self.failures.lock().unwrap() = failures.into();
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transformer for ScriptedTransformer {
    async fn transform(&self, request: &TransformRequest) -> Result<String, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut document = Document::parse(&request.document);
        if let Some(edit) = self.edits.get(&request.pass_number) {
            edit.apply(&mut document);
        }
        Ok(format!("Here you go:\n<document>\n{}\n</document>", document.render()))
    }
}
