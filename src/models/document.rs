//! Retrieval corpus documents.
//!
//! The corpus is a set of typed JSONL files; each line is one document. The
//! metadata is a tagged enum so the retriever routes by pattern matching
//! instead of string-keyed dictionaries.

use serde::{Deserialize, Serialize};

/// Closed set of corpus document kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocKind {
    Schema,
    Example,
    Template,
    Glossary,
    DiagnosisMap,
    ProcedureMap,
    LabelIntent,
    ColumnValue,
    TableProfile,
}

impl DocKind {
    pub const ALL: [DocKind; 9] = [
        DocKind::Schema,
        DocKind::Example,
        DocKind::Template,
        DocKind::Glossary,
        DocKind::DiagnosisMap,
        DocKind::ProcedureMap,
        DocKind::LabelIntent,
        DocKind::ColumnValue,
        DocKind::TableProfile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocKind::Schema => "schema",
            DocKind::Example => "example",
            DocKind::Template => "template",
            DocKind::Glossary => "glossary",
            DocKind::DiagnosisMap => "diagnosis_map",
            DocKind::ProcedureMap => "procedure_map",
            DocKind::LabelIntent => "label_intent",
            DocKind::ColumnValue => "column_value",
            DocKind::TableProfile => "table_profile",
        }
    }

    /// Dictionary-style corpora score with the lexical-heavy weight profile.
    pub fn is_dictionary(&self) -> bool {
        matches!(
            self,
            DocKind::DiagnosisMap
                | DocKind::ProcedureMap
                | DocKind::LabelIntent
                | DocKind::ColumnValue
        )
    }
}

/// Type-specific metadata, tagged by document kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocMeta {
    Schema {
        table: String,
    },
    Example {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Template {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Glossary {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        term: Option<String>,
    },
    DiagnosisMap {
        term: String,
    },
    ProcedureMap {
        term: String,
    },
    LabelIntent {
        name: String,
    },
    ColumnValue {
        table: String,
        column: String,
    },
    TableProfile {
        table: String,
    },
}

impl DocMeta {
    pub fn kind(&self) -> DocKind {
        match self {
            DocMeta::Schema { .. } => DocKind::Schema,
            DocMeta::Example { .. } => DocKind::Example,
            DocMeta::Template { .. } => DocKind::Template,
            DocMeta::Glossary { .. } => DocKind::Glossary,
            DocMeta::DiagnosisMap { .. } => DocKind::DiagnosisMap,
            DocMeta::ProcedureMap { .. } => DocKind::ProcedureMap,
            DocMeta::LabelIntent { .. } => DocKind::LabelIntent,
            DocMeta::ColumnValue { .. } => DocKind::ColumnValue,
            DocMeta::TableProfile { .. } => DocKind::TableProfile,
        }
    }

    /// Table this document describes, when the kind carries one.
    pub fn table(&self) -> Option<&str> {
        match self {
            DocMeta::Schema { table }
            | DocMeta::ColumnValue { table, .. }
            | DocMeta::TableProfile { table } => Some(table),
            _ => None,
        }
    }
}

/// One retrieval unit. Identity is a stable content hash; documents are
/// immutable once indexed and replaced by version on reindex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Doc {
    pub id: String,
    pub text: String,
    pub metadata: DocMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Doc {
    pub fn new(text: impl Into<String>, metadata: DocMeta) -> Self {
        let text = text.into();
        let id = crate::utils::sql_text::sql_hash(&text);
        Self { id, text, metadata, embedding: None }
    }

    pub fn kind(&self) -> DocKind {
        self.metadata.kind()
    }
}

/// One budgeted context entry handed to the SQL agents.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ContextItem {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub source: String,
}

/// Retrieved context grouped by agent-facing role.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RetrievalContext {
    pub schemas: Vec<ContextItem>,
    pub examples: Vec<ContextItem>,
    pub templates: Vec<ContextItem>,
    pub glossary: Vec<ContextItem>,
}

impl RetrievalContext {
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
            && self.examples.is_empty()
            && self.templates.is_empty()
            && self.glossary.is_empty()
    }

    /// Concatenated context text in prompt order.
    pub fn as_prompt_text(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        for (label, items) in [
            ("SCHEMAS", &self.schemas),
            ("EXAMPLES", &self.examples),
            ("TEMPLATES", &self.templates),
            ("GLOSSARY", &self.glossary),
        ] {
            if items.is_empty() {
                continue;
            }
            parts.push(format!("## {}", label));
            for item in items {
                parts.push(item.text.clone());
            }
        }
        parts.join("\n")
    }
}
