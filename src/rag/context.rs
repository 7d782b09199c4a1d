//! Augmentation stage: render retrieved trends and the query into a prompt
//!
//! Pure and deterministic. Identical inputs always produce the identical
//! prompt, byte for byte.

use serde::{Deserialize, Serialize};

use crate::rag::index::RetrievedRecord;
use crate::rag::retrieval::{RetrievalMode, RetrievalResult};

const MISSING_FIELD: &str = "N/A";

/// Fixed text around the rendered context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Opening lines establishing the role
    pub preamble: String,
    /// Description of the expected output shape
    pub instructions: String,
    /// Shown in place of the context when nothing was retrieved
    pub empty_context: String,
    /// Appended to the context when the records are unranked
    pub unranked_note: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            preamble: "You are an expert fashion stylist and trend advisor.\n\
                       Based on the following current fashion trends, provide personalized recommendations."
                .to_string(),
            instructions: "Please provide:\n\
                           1. 3-5 specific fashion recommendations based on these trends\n\
                           2. Styling tips that match the user's request\n\
                           3. Color palette suggestions\n\
                           4. Accessories to complete the look\n\n\
                           Be creative, specific, and personalized. Use the trend data to inform your recommendations."
                .to_string(),
            empty_context: "(No matching trends were found.)".to_string(),
            unranked_note: "(Note: these trends were not ranked by relevance to the query.)".to_string(),
        }
    }
}

/// Prompt builder for the generation stage
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    template: PromptTemplate,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(template: PromptTemplate) -> Self {
        Self { template }
    }

    /// Render one record's salient fields
    pub fn render_record(record: &RetrievedRecord) -> String {
        let details = if record.content.trim().is_empty() {
            record.field("description").unwrap_or(MISSING_FIELD)
        } else {
            record.content.as_str()
        };
        format!(
            "Trend: {}\nCategory: {}\nSeason: {}\nDetails: {}",
            record.field("title").unwrap_or(MISSING_FIELD),
            record.field("category").unwrap_or(MISSING_FIELD),
            record.field("season").unwrap_or(MISSING_FIELD),
            details,
        )
    }

    /// The context block alone
    pub fn render_context(&self, retrieved: &RetrievalResult) -> String {
        if retrieved.is_empty() {
            return self.template.empty_context.clone();
        }

        let mut context = retrieved
            .records()
            .map(Self::render_record)
            .collect::<Vec<_>>()
            .join("\n\n");

        if let RetrievalMode::Fallback { .. } = retrieved.mode {
            context.push_str("\n\n");
            context.push_str(&self.template.unranked_note);
        }
        context
    }

    /// Full generation prompt; an empty query yields a context-only prompt
    pub fn augment(&self, query: &str, retrieved: &RetrievalResult) -> String {
        let context = self.render_context(retrieved);
        let query = query.trim();

        let mut prompt = format!(
            "{}\n\nCURRENT FASHION TRENDS:\n{}\n\n",
            self.template.preamble, context
        );
        if !query.is_empty() {
            prompt.push_str(&format!("USER QUERY: {}\n\n", query));
        }
        prompt.push_str(&self.template.instructions);
        prompt
    }
}
