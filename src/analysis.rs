//! Document analysis result types.
//!
//! Two response shapes exist: the `documentModels` APIs return
//! `content`/`paragraphs`/`tables` at the top level, the v2.1 API nests lines
//! and tables under `readResults`/`pageResults`. Both deserialize into
//! [`AnalysisResult`]; the raw tree is kept alongside for selection-mark
//! scanning, which has to look into arbitrary nested fields.

use serde::Deserialize;
use serde_json::Value;

/// Status of an asynchronous analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Body returned when polling an operation location.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeOperation {
    pub status: JobStatus,
    #[serde(default)]
    pub analyze_result: Option<Value>,
    #[serde(default)]
    pub error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl OperationError {
    pub fn describe(&self) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (None, Some(message)) => message.clone(),
            (Some(code), None) => code.clone(),
            (None, None) => "no error details returned".to_string(),
        }
    }
}

/// Read-only view of an `analyzeResult` tree.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub paragraphs: Vec<Paragraph>,
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub read_results: Vec<ReadResult>,
    #[serde(default)]
    pub page_results: Vec<PageResult>,
    /// The untouched JSON tree.
    #[serde(skip)]
    pub tree: Value,
}

impl AnalysisResult {
    pub fn from_value(tree: Value) -> Result<Self, serde_json::Error> {
        let mut result: AnalysisResult = serde_json::from_value(tree.clone())?;
        result.tree = tree;
        Ok(result)
    }

    /// Tables from either response shape, in document order.
    pub fn all_tables(&self) -> impl Iterator<Item = &Table> {
        self.tables
            .iter()
            .chain(self.page_results.iter().flat_map(|p| p.tables.iter()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Paragraph {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    /// `rows` in v2.1.
    #[serde(default, alias = "rows")]
    pub row_count: Option<usize>,
    /// `columns` in v2.1.
    #[serde(default, alias = "columns")]
    pub column_count: Option<usize>,
    #[serde(default)]
    pub cells: Vec<TableCell>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCell {
    pub row_index: usize,
    pub column_index: usize,
    /// `content` in current APIs, `text` in v2.1.
    #[serde(default, alias = "text")]
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadResult {
    #[serde(default)]
    pub lines: Vec<ReadLine>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadLine {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageResult {
    #[serde(default)]
    pub tables: Vec<Table>,
}
