//! BigQuery warehouse client.

use async_trait::async_trait;
use gcp_bigquery_client::Client;
use gcp_bigquery_client::client_builder::ClientBuilder;
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::model::dataset::Dataset;
use gcp_bigquery_client::model::job::Job;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use super::{LoadOutcome, LoadRequest, WarehouseClient};
use crate::error::LoadError;

/// Interval between load job status polls.
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(5);

const HTTP_NOT_FOUND: i64 = 404;
const HTTP_CONFLICT: i64 = 409;

/// Warehouse client backed by the BigQuery REST API.
pub struct BigQueryWarehouse {
    client: Client,
}

impl std::fmt::Debug for BigQueryWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQueryWarehouse").finish_non_exhaustive()
    }
}

fn warehouse_error(err: BQError) -> LoadError {
    LoadError::Warehouse {
        message: err.to_string(),
    }
}

fn response_code(err: &BQError) -> Option<i64> {
    match err {
        BQError::ResponseError { error } => Some(error.error.code),
        _ => None,
    }
}

impl BigQueryWarehouse {
    /// Authenticate with a service account key file, or with application
    /// default credentials when no key path is given.
    pub async fn connect(service_account_path: Option<&str>) -> Result<Self, LoadError> {
        let client = match service_account_path {
            Some(path) => ClientBuilder::new()
                .build_from_service_account_key_file(path)
                .await
                .map_err(warehouse_error)?,
            None => ClientBuilder::new()
                .build_from_application_default_credentials()
                .await
                .map_err(warehouse_error)?,
        };
        Ok(Self { client })
    }
}

/// REST body for a load job.
pub fn load_job_body(request: &LoadRequest) -> Result<Value, LoadError> {
    let mut parts = request.table_id.split('.');
    let (Some(project), Some(dataset), Some(table), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(LoadError::InvalidTableId {
            table_id: request.table_id.clone(),
            parts: request.table_id.split('.').count(),
        });
    };

    Ok(json!({
        "jobReference": {
            "projectId": project,
            "location": request.location,
        },
        "configuration": {
            "load": {
                "sourceUris": [request.uri],
                "sourceFormat": request.source_format.as_str(),
                "destinationTable": {
                    "projectId": project,
                    "datasetId": dataset,
                    "tableId": table,
                },
                "schema": { "fields": request.schema },
                "writeDisposition": request.write_mode.disposition(),
                "createDisposition": "CREATE_IF_NEEDED",
                "ignoreUnknownValues": request.ignore_unknown_values,
            }
        }
    }))
}

/// Job state as reported by the API.
#[derive(Debug, Default, PartialEq, Eq)]
struct JobProgress {
    job_id: Option<String>,
    done: bool,
    error: Option<String>,
    output_rows: Option<u64>,
}

fn job_progress(job: &Job) -> Result<JobProgress, LoadError> {
    let value = serde_json::to_value(job).map_err(|source| LoadError::Warehouse {
        message: source.to_string(),
    })?;
    Ok(progress_from_value(&value))
}

fn progress_from_value(value: &Value) -> JobProgress {
    let status = &value["status"];

    let error = status["errorResult"]["message"]
        .as_str()
        .map(str::to_string)
        .map(|first| {
            let details: Vec<&str> = status["errors"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|e| e["message"].as_str())
                .filter(|message| *message != first)
                .collect();
            if details.is_empty() {
                first
            } else {
                format!("{first}; {}", details.join("; "))
            }
        });

    // outputRows is an int64 and arrives as a string
    let rows = &value["statistics"]["load"]["outputRows"];
    let output_rows = rows
        .as_u64()
        .or_else(|| rows.as_str().and_then(|s| s.parse().ok()));

    JobProgress {
        job_id: value["jobReference"]["jobId"].as_str().map(str::to_string),
        done: status["state"].as_str() == Some("DONE"),
        error,
        output_rows,
    }
}

#[async_trait]
impl WarehouseClient for BigQueryWarehouse {
    async fn ensure_dataset(
        &self,
        project_id: &str,
        dataset_id: &str,
        location: &str,
        description: &str,
    ) -> Result<(), LoadError> {
        match self.client.dataset().get(project_id, dataset_id).await {
            Ok(_) => {
                debug!(project_id, dataset_id, "Dataset exists");
                return Ok(());
            }
            Err(err) if response_code(&err) == Some(HTTP_NOT_FOUND) => {}
            Err(err) => return Err(warehouse_error(err)),
        }

        let dataset: Dataset = serde_json::from_value(json!({
            "datasetReference": {
                "projectId": project_id,
                "datasetId": dataset_id,
            },
            "location": location,
            "description": description,
        }))
        .map_err(|source| LoadError::Warehouse {
            message: source.to_string(),
        })?;

        match self.client.dataset().create(dataset).await {
            Ok(_) => {
                info!(project_id, dataset_id, location, "Created dataset");
                Ok(())
            }
            // created concurrently
            Err(err) if response_code(&err) == Some(HTTP_CONFLICT) => Ok(()),
            Err(err) => Err(warehouse_error(err)),
        }
    }

    async fn bulk_load(&self, request: &LoadRequest) -> Result<LoadOutcome, LoadError> {
        let body = load_job_body(request)?;
        let project_id = body["jobReference"]["projectId"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let job: Job = serde_json::from_value(body).map_err(|source| LoadError::Warehouse {
            message: source.to_string(),
        })?;

        let inserted = self
            .client
            .job()
            .insert(&project_id, job)
            .await
            .map_err(warehouse_error)?;
        let mut progress = job_progress(&inserted)?;
        let job_id = progress.job_id.clone().ok_or_else(|| LoadError::Warehouse {
            message: "load job response has no job id".to_string(),
        })?;
        info!(table_id = %request.table_id, job_id = %job_id, uri = %request.uri, "Load job submitted");

        while !progress.done {
            sleep(JOB_POLL_INTERVAL).await;
            let job = self
                .client
                .job()
                .get_job(&project_id, &job_id, Some(&request.location))
                .await
                .map_err(warehouse_error)?;
            progress = job_progress(&job)?;
            debug!(job_id = %job_id, done = progress.done, "Polled load job");
        }

        if let Some(message) = progress.error {
            return Err(LoadError::JobFailed {
                table_id: request.table_id.clone(),
                message,
            });
        }

        Ok(LoadOutcome {
            job_id,
            output_rows: progress.output_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::SourceFormat;
    use crate::config::WriteMode;

    fn request(table_id: &str, write_mode: WriteMode) -> LoadRequest {
        LoadRequest {
            uri: "gs://staging-bucket/openaire/publication/*_NR.json.gz".to_string(),
            table_id: table_id.to_string(),
            schema: json!([{"name": "id", "type": "STRING", "mode": "REQUIRED"}]),
            source_format: SourceFormat::NewlineDelimitedJson,
            write_mode,
            ignore_unknown_values: true,
            location: "US".to_string(),
        }
    }

    #[test]
    fn test_load_job_body() {
        let body = load_job_body(&request("proj.ds.publication", WriteMode::Replace)).unwrap();
        let load = &body["configuration"]["load"];

        assert_eq!(body["jobReference"]["projectId"], "proj");
        assert_eq!(body["jobReference"]["location"], "US");
        assert_eq!(load["destinationTable"]["datasetId"], "ds");
        assert_eq!(load["destinationTable"]["tableId"], "publication");
        assert_eq!(load["writeDisposition"], "WRITE_TRUNCATE");
        assert_eq!(load["sourceFormat"], "NEWLINE_DELIMITED_JSON");
        assert_eq!(load["ignoreUnknownValues"], true);
        assert_eq!(load["schema"]["fields"][0]["name"], "id");
    }

    #[test]
    fn test_load_job_body_append() {
        let body = load_job_body(&request("proj.ds.relation", WriteMode::Append)).unwrap();
        assert_eq!(body["configuration"]["load"]["writeDisposition"], "WRITE_APPEND");
    }

    #[test]
    fn test_load_job_body_rejects_bad_table_id() {
        for (table_id, parts) in [("ds.table", 2), ("a.b.c.d", 4)] {
            let err = load_job_body(&request(table_id, WriteMode::Replace)).unwrap_err();
            assert!(
                matches!(err, LoadError::InvalidTableId { parts: p, .. } if p == parts),
                "{table_id}"
            );
        }
    }

    #[test]
    fn test_progress_running() {
        let progress = progress_from_value(&json!({
            "jobReference": {"jobId": "job_1"},
            "status": {"state": "RUNNING"}
        }));
        assert_eq!(progress.job_id.as_deref(), Some("job_1"));
        assert!(!progress.done);
        assert!(progress.error.is_none());
    }

    #[test]
    fn test_progress_done_with_rows() {
        let progress = progress_from_value(&json!({
            "jobReference": {"jobId": "job_2"},
            "status": {"state": "DONE"},
            "statistics": {"load": {"outputRows": "1234"}}
        }));
        assert!(progress.done);
        assert_eq!(progress.output_rows, Some(1234));
    }

    #[test]
    fn test_progress_error_collects_details() {
        let progress = progress_from_value(&json!({
            "status": {
                "state": "DONE",
                "errorResult": {"message": "Error while reading data"},
                "errors": [
                    {"message": "Error while reading data"},
                    {"message": "No such field: extra"}
                ]
            }
        }));
        assert_eq!(
            progress.error.as_deref(),
            Some("Error while reading data; No such field: extra")
        );
    }
}
