//! Wire encoding for query jobs and result rows.
//!
//! Both records travel through the set store as JSON objects. Field names
//! are fixed and shared with the producer that fills the job queue and the
//! consumer that drains the result set, so they keep their historical
//! spelling (including `Hypenated`).

use serde::{Deserialize, Serialize};

use crate::error::{GrabError, Result};

/// One pre-built unit of work claimed from the job queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct QueryJob {
    /// Statement run before the main query; empty when no setup is needed.
    #[serde(rename = "TempTable")]
    pub setup_statement: String,
    /// Main query text with a single `$1` placeholder.
    #[serde(rename = "PsqlQuery")]
    pub query_text: String,
    /// Value bound to `$1`.
    #[serde(rename = "PsqlData")]
    pub query_parameter: String,
}

impl QueryJob {
    pub fn new(
        setup_statement: impl Into<String>,
        query_text: impl Into<String>,
        query_parameter: impl Into<String>,
    ) -> Self {
        Self {
            setup_statement: setup_statement.into(),
            query_text: query_text.into(),
            query_parameter: query_parameter.into(),
        }
    }

    pub fn needs_setup(&self) -> bool {
        !self.setup_statement.trim().is_empty()
    }
}

/// One line of query output.
///
/// Column order matches the relational result set; `executor` scans rows
/// positionally in exactly this order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct ResultRow {
    #[serde(rename = "WkUID")]
    pub work_id: String,
    #[serde(rename = "TbIndex")]
    pub table_index: i64,
    #[serde(rename = "Lvl5Value")]
    pub level_5: String,
    #[serde(rename = "Lvl4Value")]
    pub level_4: String,
    #[serde(rename = "Lvl3Value")]
    pub level_3: String,
    #[serde(rename = "Lvl2Value")]
    pub level_2: String,
    #[serde(rename = "Lvl1Value")]
    pub level_1: String,
    #[serde(rename = "Lvl0Value")]
    pub level_0: String,
    #[serde(rename = "MarkedUp")]
    pub marked_up: String,
    #[serde(rename = "Accented")]
    pub accented: String,
    #[serde(rename = "Stripped")]
    pub stripped: String,
    #[serde(rename = "Hypenated")]
    pub hyphenated: String,
    #[serde(rename = "Annotations")]
    pub annotations: String,
}

/// Number of positional columns a relational row must carry.
pub const RESULT_ROW_COLUMNS: usize = 13;

pub fn encode_job(job: &QueryJob) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(job)?)
}

pub fn decode_job(bytes: &[u8]) -> Result<QueryJob> {
    serde_json::from_slice(bytes)
        .map_err(|err| GrabError::MalformedPayload(format!("query job: {err}")))
}

pub fn encode_row(row: &ResultRow) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(row)?)
}

pub fn decode_row(bytes: &[u8]) -> Result<ResultRow> {
    serde_json::from_slice(bytes)
        .map_err(|err| GrabError::MalformedPayload(format!("result row: {err}")))
}
