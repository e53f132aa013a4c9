use std::collections::HashMap;
use std::time::Duration;

use common::DatasetRef;
use regex::Regex;

use crate::error::StageError;

// params from storage class
pub const KEY_API_ENDPOINT: &str = "apiEndpoint";
pub const KEY_API_USER: &str = "apiUser";
pub const KEY_DATA_SOURCE: &str = "dataSource";
// params from pvc
pub const KEY_DATASET_NAME: &str = "atom.supremind.com/dataset-name";
pub const KEY_DATASET_VERSION: &str = "atom.supremind.com/dataset-version";
pub const KEY_DATASET_CREATOR: &str = "atom.supremind.com/dataset-creator";
pub const KEY_DATASET_PATH: &str = "atom.supremind.com/dataset-path";
pub const KEY_DATASET_INDEX_KEY: &str = "atom.supremind.com/dataset-index-key";
pub const KEY_DATASET_INDEX_URI_REGEXP: &str = "atom.supremind.com/dataset-index-uri-regexp";

pub const DEFAULT_VERSION: &str = "dev";
pub const DEFAULT_STAGE_WAIT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub name: String,
    pub node_id: String,
    pub endpoint: String,
    pub version: String,
    /// Connect timeout for catalog connections; zero disables it.
    pub dial_timeout: Duration,
    /// How long a stage call waits for the build of its volume.
    pub stage_wait_timeout: Duration,
}

impl DriverConfig {
    pub fn new(
        name: impl Into<String>,
        node_id: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Result<Self, String> {
        let config = DriverConfig {
            name: name.into(),
            node_id: node_id.into(),
            endpoint: endpoint.into(),
            version: DEFAULT_VERSION.to_string(),
            dial_timeout: Duration::ZERO,
            stage_wait_timeout: DEFAULT_STAGE_WAIT,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_version(mut self, version: &str) -> Self {
        if !version.is_empty() {
            self.version = version.to_string();
        }
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_stage_wait_timeout(mut self, timeout: Duration) -> Self {
        self.stage_wait_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut validation_errors = Vec::new();
        if self.name.is_empty() {
            validation_errors.push("no driver name provided");
        }
        if self.node_id.is_empty() {
            validation_errors.push("no node id provided");
        }
        if self.endpoint.is_empty() {
            validation_errors.push("no driver endpoint provided");
        }
        if validation_errors.is_empty() {
            Ok(())
        } else {
            Err(validation_errors.join("; "))
        }
    }
}

/// Index file settings of a stage request.
#[derive(Clone, Debug)]
pub struct IndexParams {
    /// Annotation selected as the index; also the index file name.
    pub annotation_key: String,
    /// Pattern whose first capture group is replaced with the local file path.
    pub uri_pattern: Option<Regex>,
    /// Where the dataset is mounted inside containers.
    pub mount_prefix: String,
}

/// Typed view of the volume context handed to a stage request.
#[derive(Clone, Debug)]
pub struct StageParams {
    pub endpoint: String,
    pub user: String,
    pub dataset: DatasetRef,
    pub index: Option<IndexParams>,
}

impl StageParams {
    pub fn from_context(ctx: &HashMap<String, String>) -> Result<Self, StageError> {
        let mut missing = Vec::new();
        let mut required = |key: &'static str| match ctx.get(key).map(|v| v.trim()) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => {
                missing.push(key);
                String::new()
            }
        };
        let endpoint = required(KEY_API_ENDPOINT);
        let user = required(KEY_API_USER);
        let dataset = DatasetRef {
            name: required(KEY_DATASET_NAME),
            version: required(KEY_DATASET_VERSION),
            creator: required(KEY_DATASET_CREATOR),
        };
        if !missing.is_empty() {
            return Err(StageError::InvalidArgument(format!(
                "missing volume context: {}",
                missing.join(", ")
            )));
        }

        let optional = |key: &str| ctx.get(key).filter(|v| !v.is_empty()).cloned();
        let index = match optional(KEY_DATASET_INDEX_KEY) {
            None => None,
            Some(annotation_key) => {
                check_index_file_name(&annotation_key)?;
                let uri_pattern = optional(KEY_DATASET_INDEX_URI_REGEXP)
                    .map(|pattern| compile_uri_pattern(&pattern))
                    .transpose()?;
                let mount_prefix = optional(KEY_DATASET_PATH).unwrap_or_default();
                if uri_pattern.is_some() && mount_prefix.is_empty() {
                    return Err(StageError::InvalidArgument(format!(
                        "{KEY_DATASET_INDEX_URI_REGEXP} requires {KEY_DATASET_PATH}"
                    )));
                }
                Some(IndexParams {
                    annotation_key,
                    uri_pattern,
                    mount_prefix,
                })
            }
        };

        Ok(StageParams {
            endpoint,
            user,
            dataset,
            index,
        })
    }
}

/// The annotation key names the index file, so it must stay a single file name.
fn check_index_file_name(key: &str) -> Result<(), StageError> {
    if matches!(key, "." | "..") || key.contains(['/', '\0']) {
        return Err(StageError::InvalidArgument(format!(
            "invalid {KEY_DATASET_INDEX_KEY} `{key}`: must be a single file name"
        )));
    }
    Ok(())
}

fn compile_uri_pattern(pattern: &str) -> Result<Regex, StageError> {
    let re = Regex::new(pattern).map_err(|e| {
        StageError::InvalidArgument(format!("invalid {KEY_DATASET_INDEX_URI_REGEXP}: {e}"))
    })?;
    // group 0 is the whole match
    if re.captures_len() < 2 {
        return Err(StageError::InvalidArgument(format!(
            "{KEY_DATASET_INDEX_URI_REGEXP} `{pattern}` has no capture group"
        )));
    }
    Ok(re)
}
