use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::{DEFAULT_VERSION, DriverConfig};
use crate::node::{
    PublishRequest, StageRequest, UnpublishRequest, UnstageRequest, VolumeCapability,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// CSI driver name
    #[arg(long, env = "DATASET_DRIVER_NAME", default_value = "dataset.csi.supremind.com")]
    pub driver_name: String,

    /// Node id reported by the node service
    #[arg(long, env = "NODE_ID")]
    pub node_id: String,

    /// CSI endpoint
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    pub endpoint: String,

    /// Driver version
    #[arg(long, env = "DATASET_DRIVER_VERSION", default_value = DEFAULT_VERSION)]
    pub driver_version: String,

    /// Catalog connect timeout in seconds, 0 disables it
    #[arg(long, env = "DATASET_DIAL_TIMEOUT", default_value_t = 0)]
    pub dial_timeout: u64,

    /// Seconds a stage request waits for its build
    #[arg(long, env = "DATASET_STAGE_WAIT", default_value_t = 10)]
    pub stage_wait: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(about = "Build the dataset database and index under a staging directory")]
    Stage {
        #[arg(long)]
        volume_id: String,
        #[arg(long)]
        staging_path: PathBuf,
        /// Volume context entry, repeatable
        #[arg(short, long = "param", value_parser = parse_param, num_args = 1)]
        params: Vec<(String, String)>,
    },
    #[command(about = "Remove the staged database and index")]
    Unstage {
        #[arg(long)]
        volume_id: String,
        #[arg(long)]
        staging_path: PathBuf,
    },
    #[command(about = "Mount a staged dataset on a target directory")]
    Publish {
        #[arg(long)]
        volume_id: String,
        #[arg(long)]
        staging_path: PathBuf,
        #[arg(long)]
        target_path: PathBuf,
        #[arg(short, long = "param", value_parser = parse_param, num_args = 1)]
        params: Vec<(String, String)>,
    },
    #[command(about = "Unmount a published dataset")]
    Unpublish {
        #[arg(long)]
        volume_id: String,
        #[arg(long)]
        target_path: PathBuf,
    },
    #[command(about = "Print node id and capabilities")]
    Info,
}

impl Args {
    pub fn driver_config(&self) -> Result<DriverConfig, String> {
        Ok(
            DriverConfig::new(&self.driver_name, &self.node_id, &self.endpoint)?
                .with_version(&self.driver_version)
                .with_dial_timeout(Duration::from_secs(self.dial_timeout))
                .with_stage_wait_timeout(Duration::from_secs(self.stage_wait)),
        )
    }
}

impl Command {
    pub fn stage_request(
        volume_id: String,
        staging_path: PathBuf,
        params: Vec<(String, String)>,
    ) -> StageRequest {
        StageRequest {
            volume_id,
            staging_path,
            capability: Some(VolumeCapability::mount()),
            volume_context: into_context(params),
        }
    }

    pub fn publish_request(
        volume_id: String,
        staging_path: PathBuf,
        target_path: PathBuf,
        params: Vec<(String, String)>,
    ) -> PublishRequest {
        PublishRequest {
            volume_id,
            staging_path,
            target_path,
            capability: Some(VolumeCapability::mount()),
            volume_context: into_context(params),
        }
    }

    pub fn unstage_request(volume_id: String, staging_path: PathBuf) -> UnstageRequest {
        UnstageRequest {
            volume_id,
            staging_path,
        }
    }

    pub fn unpublish_request(volume_id: String, target_path: PathBuf) -> UnpublishRequest {
        UnpublishRequest {
            volume_id,
            target_path,
        }
    }
}

fn into_context(params: Vec<(String, String)>) -> HashMap<String, String> {
    params.into_iter().collect()
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid key=value: no `=` found in `{s}`"))?;
    if key.is_empty() {
        return Err(format!("invalid key=value: empty key in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}
