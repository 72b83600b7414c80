use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Scalar label value. Labels never nest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl LabelValue {
    /// Compact JSON text used for storage and equality filters.
    pub fn to_json_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl fmt::Display for LabelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelValue::Bool(b) => write!(f, "{b}"),
            LabelValue::Number(n) => write!(f, "{n}"),
            LabelValue::String(s) => f.write_str(s),
        }
    }
}

/// String-keyed scalar label map. `BTreeMap` keeps serialization deterministic.
pub type Labels = BTreeMap<String, LabelValue>;

/// Terraform lock metadata, in the exact JSON shape the Terraform HTTP
/// backend sends on LOCK and expects back in a 423 response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Operation", default)]
    pub operation: String,
    #[serde(rename = "Info", default)]
    pub info: String,
    #[serde(rename = "Who", default)]
    pub who: String,
    #[serde(rename = "Version", default)]
    pub version: String,
    #[serde(rename = "Created", default)]
    pub created: String,
    #[serde(rename = "Path", default)]
    pub path: String,
}

/// A stored Terraform state, without its content bytes.
///
/// Content is fetched separately through `StateStore::get_content` so that
/// listings never drag state documents around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub guid: String,
    pub logic_id: String,
    pub serial: i64,
    pub lineage: Option<String>,
    pub terraform_version: Option<String>,
    pub size_bytes: i64,
    pub labels: Labels,
    pub lock: Option<LockInfo>,
    /// RFC 3339 timestamp string.
    pub created_at: String,
    /// RFC 3339 timestamp string.
    pub updated_at: String,
}

impl StateRecord {
    /// True once any content has been uploaded.
    pub fn has_content(&self) -> bool {
        self.size_bytes > 0
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }
}

/// Input for `StateStore::create_state`.
#[derive(Debug, Clone)]
pub struct NewState {
    pub guid: String,
    pub logic_id: String,
    pub labels: Labels,
    pub created_at: String,
}

/// Filter + cursor for `StateStore::list_states`.
///
/// Results are ordered by GUID ascending. `after_guid` is an exclusive
/// cursor; `limit == 0` means no limit.
#[derive(Debug, Clone, Default)]
pub struct StateQuery {
    /// Every entry must match exactly (AND).
    pub labels: Labels,
    pub logic_id_prefix: Option<String>,
    pub after_guid: Option<String>,
    pub limit: usize,
}

impl StateQuery {
    /// In-process evaluation of the filter part of the query (not the cursor).
    pub fn matches(&self, state: &StateRecord) -> bool {
        if let Some(prefix) = &self.logic_id_prefix {
            if !state.logic_id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| state.labels.get(k).is_some_and(|have| have == v))
    }
}

/// Digest of one output as extracted from uploaded content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDigest {
    pub key: String,
    pub digest: String,
    pub sensitive: bool,
}

/// Everything `StateStore::update_content` writes in a single transaction.
#[derive(Debug, Clone)]
pub struct ContentUpdate {
    pub content: Vec<u8>,
    pub serial: i64,
    pub lineage: Option<String>,
    pub terraform_version: Option<String>,
    pub outputs: Vec<OutputDigest>,
    /// Lock id presented by the writer. Required to match when the state is locked.
    pub lock_id: Option<String>,
    /// Optimistic check against the stored serial.
    pub expected_serial: Option<i64>,
    pub updated_at: String,
}

/// Where an output's JSON Schema came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaSource {
    Manual,
    Inferred,
}

impl SchemaSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SchemaSource::Manual => "manual",
            SchemaSource::Inferred => "inferred",
        }
    }
}

impl FromStr for SchemaSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(SchemaSource::Manual),
            "inferred" => Ok(SchemaSource::Inferred),
            other => Err(format!("unknown schema source '{other}'")),
        }
    }
}

/// Outcome of validating an output value against its schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    Invalid,
    Error,
    NotValidated,
}

impl ValidationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationStatus::Valid => "valid",
            ValidationStatus::Invalid => "invalid",
            ValidationStatus::Error => "error",
            ValidationStatus::NotValidated => "not_validated",
        }
    }
}

impl FromStr for ValidationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(ValidationStatus::Valid),
            "invalid" => Ok(ValidationStatus::Invalid),
            "error" => Ok(ValidationStatus::Error),
            "not_validated" => Ok(ValidationStatus::NotValidated),
            other => Err(format!("unknown validation status '{other}'")),
        }
    }
}

/// Cached metadata for one output of one state.
///
/// `digest` is `None` for placeholder rows that exist only to carry a
/// manually attached schema for an output the producer has not published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputKeyRecord {
    pub state_guid: String,
    pub key: String,
    pub digest: Option<String>,
    pub sensitive: bool,
    pub schema_json: Option<String>,
    pub schema_source: Option<SchemaSource>,
    pub validation_status: ValidationStatus,
    pub validation_error: Option<String>,
    pub validated_at: Option<String>,
}

impl OutputKeyRecord {
    /// True if the producer's current content carries this output.
    pub fn is_present(&self) -> bool {
        self.digest.is_some()
    }
}

/// Persisted status of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeStatus {
    Pending,
    Clean,
    Dirty,
    CleanInvalid,
    DirtyInvalid,
    Mock,
    MissingOutput,
}

impl EdgeStatus {
    pub const ALL: [EdgeStatus; 7] = [
        EdgeStatus::Pending,
        EdgeStatus::Clean,
        EdgeStatus::Dirty,
        EdgeStatus::CleanInvalid,
        EdgeStatus::DirtyInvalid,
        EdgeStatus::Mock,
        EdgeStatus::MissingOutput,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EdgeStatus::Pending => "pending",
            EdgeStatus::Clean => "clean",
            EdgeStatus::Dirty => "dirty",
            EdgeStatus::CleanInvalid => "clean-invalid",
            EdgeStatus::DirtyInvalid => "dirty-invalid",
            EdgeStatus::Mock => "mock",
            EdgeStatus::MissingOutput => "missing-output",
        }
    }

    /// The consumer is behind the producer or the producer no longer
    /// publishes the output.
    pub fn is_stale(self) -> bool {
        matches!(
            self,
            EdgeStatus::Dirty | EdgeStatus::DirtyInvalid | EdgeStatus::MissingOutput
        )
    }
}

impl fmt::Display for EdgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EdgeStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown edge status '{s}'"))
    }
}

/// A directed dependency from a producer's output to a consumer's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub id: i64,
    pub from_guid: String,
    pub from_output: String,
    pub to_guid: String,
    pub to_input_name: String,
    pub status: EdgeStatus,
    pub in_digest: Option<String>,
    pub out_digest: Option<String>,
    pub mock_value_json: Option<String>,
    pub last_in_at: Option<String>,
    pub last_out_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl EdgeRecord {
    /// True if `other` names the same `(from_guid, from_output, to_guid, to_input_name)`.
    pub fn same_identity(&self, other: &NewEdge) -> bool {
        self.from_guid == other.from_guid
            && self.from_output == other.from_output
            && self.to_guid == other.to_guid
            && self.to_input_name == other.to_input_name
    }
}

/// Input for `EdgeStore::insert_edge`. The initial status and `out_digest`
/// are computed by the caller from the producer's current outputs.
#[derive(Debug, Clone)]
pub struct NewEdge {
    pub from_guid: String,
    pub from_output: String,
    pub to_guid: String,
    pub to_input_name: String,
    pub mock_value_json: Option<String>,
    pub status: EdgeStatus,
    pub out_digest: Option<String>,
    pub created_at: String,
}

/// Full replacement of an edge's derived fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeUpdate {
    pub status: EdgeStatus,
    pub in_digest: Option<String>,
    pub out_digest: Option<String>,
    pub last_in_at: Option<String>,
    pub last_out_at: Option<String>,
    pub updated_at: String,
}

impl EdgeUpdate {
    /// Start from the edge's current values.
    pub fn from_edge(edge: &EdgeRecord) -> Self {
        Self {
            status: edge.status,
            in_digest: edge.in_digest.clone(),
            out_digest: edge.out_digest.clone(),
            last_in_at: edge.last_in_at.clone(),
            last_out_at: edge.last_out_at.clone(),
            updated_at: edge.updated_at.clone(),
        }
    }
}
