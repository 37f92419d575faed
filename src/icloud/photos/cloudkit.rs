use serde::Deserialize;
use serde_json::Value;

/// Response from `/records/query`. `continuationMarker` and `syncToken` are
/// decoded for logging only; paging is rank based.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse<R = Value> {
    #[serde(default = "Vec::new")]
    pub records: Vec<R>,
    #[serde(default)]
    pub continuation_marker: Option<String>,
    #[serde(default)]
    pub sync_token: Option<String>,
}

/// Response from `/internal/records/query/batch`.
#[derive(Debug, Deserialize)]
pub struct BatchQueryResponse {
    #[serde(default)]
    pub batch: Vec<QueryResponse<Record>>,
}

/// A CloudKit record. Fields are kept as dynamic JSON because Apple's schema
/// varies by record type and changes without notice.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(default)]
    pub record_name: String,
    #[serde(default)]
    pub record_type: String,
    #[serde(default)]
    pub fields: Value,
}
