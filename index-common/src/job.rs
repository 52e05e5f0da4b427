use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default number of operator-initiated retries a job gets before it is
/// absolutely terminal.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("{0} is not a valid job status")]
    ParseStatus(String),
    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },
    #[error("job record is missing required field {0}")]
    MissingField(&'static str),
    #[error("job record field {field} could not be parsed: {value}")]
    ParseField { field: &'static str, value: String },
}

/// Enumeration of possible statuses for a Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting on the pending list to be picked up by a worker.
    Queued,
    /// Picked up by a worker and currently being run.
    Processing,
    /// Successfully indexed into the vector store.
    Completed,
    /// Terminal failure; an operator may re-queue it while retries remain.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether moving from `self` to `to` is a legal transition. A job never
    /// regresses from `Completed`; `Failed -> Queued` is the operator retry.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        if *self == to {
            return true;
        }
        matches!(
            (self, to),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Failed, JobStatus::Queued)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            invalid => Err(JobError::ParseStatus(invalid.to_owned())),
        }
    }
}

/// One unit of image indexing work.
///
/// The staged image payload is never inlined here; `image_ref` carries its
/// location. `error_message` is the empty string when there is no error,
/// on the wire and in memory alike.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// A unique id identifying a job, assigned at submission.
    pub job_id: String,
    /// Caller-supplied correlation key; not unique across jobs.
    pub product_id: String,
    /// Location of the staged image payload.
    pub image_ref: String,
    pub name: String,
    pub description: String,
    /// Arbitrary caller metadata, carried to the vector-store payload.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: String,
}

impl Job {
    pub fn new(
        product_id: &str,
        image_ref: &str,
        name: &str,
        description: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4().to_string(),
            product_id: product_id.to_owned(),
            image_ref: image_ref.to_owned(),
            name: name.to_owned(),
            description: description.to_owned(),
            metadata,
            status: JobStatus::Queued,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: now,
            updated_at: now,
            error_message: String::new(),
        }
    }

    /// Move the job to `to`, stamping `updated_at`. Rejects transitions the
    /// state machine does not allow.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition(to) {
            return Err(JobError::IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Serialize to the flat string map the store's hash primitive takes.
    pub fn to_fields(&self) -> HashMap<String, String> {
        HashMap::from([
            ("job_id".to_string(), self.job_id.clone()),
            ("product_id".to_string(), self.product_id.clone()),
            ("image_ref".to_string(), self.image_ref.clone()),
            ("name".to_string(), self.name.clone()),
            ("description".to_string(), self.description.clone()),
            (
                "metadata".to_string(),
                serde_json::Value::Object(self.metadata.clone()).to_string(),
            ),
            ("status".to_string(), self.status.to_string()),
            ("retry_count".to_string(), self.retry_count.to_string()),
            ("max_retries".to_string(), self.max_retries.to_string()),
            ("created_at".to_string(), self.created_at.to_rfc3339()),
            ("updated_at".to_string(), self.updated_at.to_rfc3339()),
            ("error_message".to_string(), self.error_message.clone()),
        ])
    }

    /// Deserialize from a persisted record snapshot.
    ///
    /// `job_id`, `product_id`, `status` and `created_at` are required.
    /// Optional fields fall back to their defaults so records written by
    /// older producers still load; unknown fields are ignored.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, JobError> {
        let required = |field: &'static str| {
            fields
                .get(field)
                .cloned()
                .ok_or(JobError::MissingField(field))
        };
        let optional = |field: &str| fields.get(field).cloned().unwrap_or_default();

        let status = JobStatus::from_str(&required("status")?)?;
        let created_at = parse_timestamp("created_at", &required("created_at")?)?;
        let updated_at = match fields.get("updated_at") {
            Some(value) => parse_timestamp("updated_at", value)?,
            None => created_at,
        };

        let metadata = fields
            .get("metadata")
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .and_then(|value| value.as_object().cloned())
            .unwrap_or_default();

        Ok(Self {
            job_id: required("job_id")?,
            product_id: required("product_id")?,
            image_ref: optional("image_ref"),
            name: optional("name"),
            description: optional("description"),
            metadata,
            status,
            retry_count: parse_counter(fields, "retry_count", 0)?,
            max_retries: parse_counter(fields, "max_retries", DEFAULT_MAX_RETRIES)?,
            created_at,
            updated_at,
            error_message: optional("error_message"),
        })
    }
}

fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, JobError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| JobError::ParseField {
            field,
            value: value.to_owned(),
        })
}

fn parse_counter(
    fields: &HashMap<String, String>,
    field: &'static str,
    default: u32,
) -> Result<u32, JobError> {
    match fields.get(field) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| JobError::ParseField {
            field,
            value: value.clone(),
        }),
    }
}
