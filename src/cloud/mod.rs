pub mod aws;

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

use crate::command::CommandError;

pub use aws::AwsCli;

/// `OutputKey -> OutputValue` of a provisioning stack.
pub type StackOutputs = BTreeMap<String, String>;

/// `LogicalResourceId -> PhysicalResourceId` of a provisioning stack.
pub type StackResources = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("cloud provider call failed: `{0}`")]
    Command(#[from] CommandError),

    #[error("unexpected output from `{command}`: `{source}`")]
    Parse {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub instance_id: String,
    pub instance_type: String,
    /// `spot` for spot instances, absent for on-demand ones.
    pub lifecycle: Option<String>,
}

/// Queries against the cloud control plane used by the harness.
#[cfg_attr(test, mockall::automock)]
pub trait CloudProvider {
    fn stack_outputs(&self, stack_name: &str, region: &str) -> Result<StackOutputs, CloudError>;

    fn stack_resources(&self, stack_name: &str, region: &str)
        -> Result<StackResources, CloudError>;

    /// Min and max size of the compute auto scaling group of the stack.
    fn asg_capacity(&self, stack_name: &str, region: &str) -> Result<Capacity, CloudError>;

    /// Min and max vCPUs of a Batch compute environment.
    fn batch_ce_capacity(
        &self,
        compute_environment: &str,
        region: &str,
    ) -> Result<Capacity, CloudError>;

    fn latest_launch_template_data(
        &self,
        launch_template_name: &str,
        region: &str,
    ) -> Result<serde_json::Value, CloudError>;

    fn find_instance(
        &self,
        stack_name: &str,
        private_dns_name: &str,
        region: &str,
    ) -> Result<Option<Instance>, CloudError>;

    /// First resource of the first statement of a role inline policy.
    fn role_inline_policy_resource(
        &self,
        role_name: &str,
        policy_name: &str,
        region: &str,
    ) -> Result<String, CloudError>;

    fn role_attached_policies(&self, role_name: &str, region: &str)
        -> Result<Vec<String>, CloudError>;

    fn instance_vcpus(&self, instance_type: &str, region: &str) -> Result<u32, CloudError>;

    fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), CloudError>;

    fn upload_file(
        &self,
        bucket: &str,
        local_path: &Path,
        key: &str,
        region: &str,
    ) -> Result<(), CloudError>;

    /// Deletes the bucket and everything in it.
    fn delete_bucket(&self, bucket: &str, region: &str) -> Result<(), CloudError>;
}
