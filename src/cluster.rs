use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::cloud::{CloudError, CloudProvider, StackOutputs, StackResources};
use crate::command::pcluster::UPDATE_COMPLETE;
use crate::command::{CommandError, CommandRunner, Pcluster};
use crate::config::{ClusterConfig, ConfigError};

pub const STACK_NAME_PREFIX: &str = "parallelcluster-";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_OS: &str = "alinux";

const MASTER_PUBLIC_IP_OUTPUT: &str = "MasterPublicIP";

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("invalid cluster config: `{0}`")]
    Config(#[from] ConfigError),

    #[error("cloud provider lookup failed: `{0}`")]
    Cloud(#[from] CloudError),

    #[error("pcluster invocation failed: `{0}`")]
    Command(#[from] CommandError),

    #[error("stack `{stack}` has no `{key}` {kind}")]
    MissingStackEntry {
        stack: String,
        key: String,
        kind: &'static str,
    },

    #[error("no ssh user known for os `{0}`")]
    UnknownOs(String),

    #[error("cluster {action} failed for {name} with output: {output}")]
    LifecycleFailed {
        action: &'static str,
        name: String,
        output: String,
    },
}

/// Static and dynamic data related to a cluster instance.
///
/// Stack outputs and resources are looked up on first access only and cached
/// for the lifetime of the record.
#[derive(Debug)]
pub struct Cluster {
    name: String,
    config_file: PathBuf,
    ssh_key: PathBuf,
    config: ClusterConfig,
    stack_outputs: Mutex<Option<StackOutputs>>,
    stack_resources: Mutex<Option<StackResources>>,
}

impl Cluster {
    pub fn new(
        name: impl Into<String>,
        config_file: impl Into<PathBuf>,
        ssh_key: impl Into<PathBuf>,
    ) -> Result<Self, ClusterError> {
        let config_file = config_file.into();
        let config = ClusterConfig::load(&config_file)?;
        Ok(Self::with_config(name, config_file, ssh_key, config))
    }

    pub fn with_config(
        name: impl Into<String>,
        config_file: impl Into<PathBuf>,
        ssh_key: impl Into<PathBuf>,
        config: ClusterConfig,
    ) -> Self {
        Self {
            name: name.into(),
            config_file: config_file.into(),
            ssh_key: ssh_key.into(),
            config,
            stack_outputs: Mutex::new(None),
            stack_resources: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn ssh_key(&self) -> &Path {
        &self.ssh_key
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Points the cluster to a new config file, usually right before an update.
    ///
    /// Cached stack data is kept, the stack is the same.
    pub fn set_config_file(&mut self, config_file: impl Into<PathBuf>) -> Result<(), ClusterError> {
        let config_file = config_file.into();
        self.config = ClusterConfig::load(&config_file)?;
        self.config_file = config_file;
        Ok(())
    }

    /// Name of the CloudFormation stack associated to the cluster.
    pub fn stack_name(&self) -> String {
        format!("{STACK_NAME_PREFIX}{}", self.name)
    }

    pub fn region(&self) -> &str {
        self.config.get_or("aws", "aws_region_name", DEFAULT_REGION)
    }

    pub fn os(&self) -> &str {
        let section = self.config.cluster_section();
        self.config.get_or(&section, "base_os", DEFAULT_OS)
    }

    /// Default ssh user of the cluster os.
    pub fn username(&self) -> Result<&'static str, ClusterError> {
        match self.os() {
            "alinux" | "alinux2" => Ok("ec2-user"),
            "centos6" | "centos7" | "centos8" => Ok("centos"),
            os if os.starts_with("ubuntu") => Ok("ubuntu"),
            os => Err(ClusterError::UnknownOs(os.to_string())),
        }
    }

    pub fn stack_outputs<C>(&self, cloud: &C) -> Result<StackOutputs, ClusterError>
    where
        C: CloudProvider + ?Sized,
    {
        let mut cached = self
            .stack_outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(outputs) = cached.as_ref() {
            return Ok(outputs.clone());
        }

        debug!(stack = %self.stack_name(), region = self.region(), "retrieving stack outputs");
        let outputs = cloud.stack_outputs(&self.stack_name(), self.region())?;
        *cached = Some(outputs.clone());
        Ok(outputs)
    }

    pub fn stack_resources<C>(&self, cloud: &C) -> Result<StackResources, ClusterError>
    where
        C: CloudProvider + ?Sized,
    {
        let mut cached = self
            .stack_resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(resources) = cached.as_ref() {
            return Ok(resources.clone());
        }

        debug!(stack = %self.stack_name(), region = self.region(), "retrieving stack resources");
        let resources = cloud.stack_resources(&self.stack_name(), self.region())?;
        *cached = Some(resources.clone());
        Ok(resources)
    }

    /// Physical id of the stack resource with the given logical id.
    pub fn stack_resource<C>(&self, cloud: &C, logical_id: &str) -> Result<String, ClusterError>
    where
        C: CloudProvider + ?Sized,
    {
        self.stack_resources(cloud)?
            .remove(logical_id)
            .ok_or_else(|| ClusterError::MissingStackEntry {
                stack: self.stack_name(),
                key: logical_id.to_string(),
                kind: "resource",
            })
    }

    /// Public ip of the cluster master node.
    pub fn master_ip<C>(&self, cloud: &C) -> Result<String, ClusterError>
    where
        C: CloudProvider + ?Sized,
    {
        self.stack_outputs(cloud)?
            .remove(MASTER_PUBLIC_IP_OUTPUT)
            .ok_or_else(|| ClusterError::MissingStackEntry {
                stack: self.stack_name(),
                key: MASTER_PUBLIC_IP_OUTPUT.to_string(),
                kind: "output",
            })
    }

    /// Updates the running cluster with its current config file.
    pub fn update<R: CommandRunner>(
        &self,
        pcluster: &Pcluster<R>,
        force: bool,
    ) -> Result<(), ClusterError> {
        info!(
            "Updating cluster {} with config {}",
            self.name,
            self.config_file.display()
        );
        let output = pcluster.update(&self.config_file, &self.name, force)?;
        if !output.stdout.contains(UPDATE_COMPLETE) {
            return Err(self.lifecycle_failed("update", output.stdout));
        }
        info!("Cluster {} updated successfully", self.name);
        Ok(())
    }

    /// Starts the compute fleet.
    pub fn start<R: CommandRunner>(&self, pcluster: &Pcluster<R>) -> Result<(), ClusterError> {
        info!("Starting cluster {}", self.name);
        pcluster.start(&self.config_file, &self.name)?;
        Ok(())
    }

    /// Stops the compute fleet.
    pub fn stop<R: CommandRunner>(&self, pcluster: &Pcluster<R>) -> Result<(), ClusterError> {
        info!("Stopping cluster {}", self.name);
        pcluster.stop(&self.config_file, &self.name)?;
        Ok(())
    }

    fn lifecycle_failed(&self, action: &'static str, output: String) -> ClusterError {
        let err = ClusterError::LifecycleFailed {
            action,
            name: self.name.clone(),
            output,
        };
        error!("{err}");
        err
    }
}
