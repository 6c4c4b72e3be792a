pub mod update;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};

use crate::assertions::AssertionError;
use crate::cli::parse_params;
use crate::cloud::aws::AwsCli;
use crate::cloud::{CloudError, CloudProvider, Instance};
use crate::cluster::{Cluster, ClusterError};
use crate::command::{CommandError, CommandRunner, Pcluster, ProcessRunner};
use crate::config::{ConfigError, ConfigReader};
use crate::factory::{ClustersFactory, FactoryError, TeardownGuard};
use crate::remote::RemoteCommandExecutor;
use crate::scheduler::SchedulerError;

/// Arguments shared by every scenario.
#[derive(Debug, Clone, clap::Args)]
pub struct ScenarioArgs {
    /// AWS region, defaults to the one the scenario targets
    #[arg(long)]
    pub region: Option<String>,

    /// Compute instance type, defaults to the one the scenario targets
    #[arg(long)]
    pub instance: Option<String>,

    /// Base os of the cluster, defaults to the one the scenario targets
    #[arg(long)]
    pub os: Option<String>,

    /// Scheduler of the cluster, defaults to the one the scenario targets
    #[arg(long)]
    pub scheduler: Option<String>,

    /// Name of the EC2 key pair set in the cluster config
    #[arg(long)]
    pub key_name: String,

    /// Private key of the key pair, used to reach the master node
    #[arg(long)]
    pub ssh_key: PathBuf,

    /// Folder with the config templates and scripts of the scenario
    #[arg(long)]
    pub test_datadir: PathBuf,

    /// Folder where rendered configs are written
    #[arg(long, default_value = "out")]
    pub output_dir: PathBuf,

    /// Cluster name, a unique one is generated when not set
    #[arg(long)]
    pub cluster_name: Option<String>,

    /// Config template parameters as `key=value` pairs separated by commas. Can be repeated.
    #[arg(long = "param", value_parser = parse_params)]
    pub params: Vec<BTreeMap<String, String>>,
}

/// Where a scenario runs unless told otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub region: &'static str,
    pub instance: &'static str,
    pub os: &'static str,
    pub scheduler: &'static str,
}

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("`{0}`")]
    Config(#[from] ConfigError),

    #[error("`{0}`")]
    Cluster(#[from] ClusterError),

    #[error("`{0}`")]
    Factory(#[from] FactoryError),

    #[error("`{0}`")]
    Cloud(#[from] CloudError),

    #[error("`{0}`")]
    Scheduler(#[from] SchedulerError),

    #[error("`{0}`")]
    Command(#[from] CommandError),

    #[error("assertion failed: {0}")]
    Assertion(#[from] AssertionError),

    #[error("cluster {0} has no compute nodes")]
    NoComputeNodes(String),

    #[error("no compute node was added to cluster {0}")]
    NoNewComputeNodes(String),

    #[error("no instance found for compute node {0}")]
    InstanceNotFound(String),
}

/// Everything a scenario needs to create, reach and check its clusters.
pub struct ScenarioContext<R, C> {
    pub region: String,
    pub instance: String,
    pub os: String,
    pub scheduler: String,
    pub cluster_name: String,
    pub ssh_key: PathBuf,
    pub test_datadir: PathBuf,
    pub reader: ConfigReader,
    pub runner: R,
    pub cloud: C,
    sleep: fn(Duration),
}

impl ScenarioContext<ProcessRunner, AwsCli<ProcessRunner>> {
    /// Context running the real `pcluster`, `aws`, `ssh` and `scp` binaries.
    pub fn from_args(args: ScenarioArgs, dimensions: Dimensions) -> Self {
        Self::new(args, dimensions, ProcessRunner, AwsCli::new(ProcessRunner))
    }
}

impl<R, C> ScenarioContext<R, C>
where
    R: CommandRunner + Clone,
    C: CloudProvider,
{
    pub fn new(args: ScenarioArgs, dimensions: Dimensions, runner: R, cloud: C) -> Self {
        let region = args.region.unwrap_or_else(|| dimensions.region.to_string());
        let instance = args.instance.unwrap_or_else(|| dimensions.instance.to_string());
        let os = args.os.unwrap_or_else(|| dimensions.os.to_string());
        let scheduler = args
            .scheduler
            .unwrap_or_else(|| dimensions.scheduler.to_string());
        let cluster_name = args
            .cluster_name
            .unwrap_or_else(|| unique_name(&format!("integ-tests-{scheduler}")));

        let mut params = BTreeMap::from([
            ("region".to_string(), region.clone()),
            ("instance".to_string(), instance.clone()),
            ("os".to_string(), os.clone()),
            ("scheduler".to_string(), scheduler.clone()),
            ("key_name".to_string(), args.key_name),
        ]);
        // later --param flags win
        for extra in args.params {
            params.extend(extra);
        }

        let reader = ConfigReader::new(
            &args.test_datadir,
            args.output_dir.join(&cluster_name),
            params,
        );

        Self {
            region,
            instance,
            os,
            scheduler,
            cluster_name,
            ssh_key: args.ssh_key,
            test_datadir: args.test_datadir,
            reader,
            runner,
            cloud,
            sleep: thread::sleep,
        }
    }

    /// Replaces the sleep used by [ScenarioContext::wait] and the node checks.
    pub fn with_sleep(self, sleep: fn(Duration)) -> Self {
        Self { sleep, ..self }
    }

    pub fn pcluster(&self) -> Pcluster<R> {
        Pcluster::new(self.runner.clone())
    }

    /// Factory whose clusters are destroyed once the scenario is over.
    pub fn clusters_factory(&self) -> TeardownGuard<R> {
        TeardownGuard::new(ClustersFactory::new(self.pcluster()))
    }

    /// Cluster record for `config_file` with the scenario name and key.
    pub fn cluster(&self, config_file: &Path) -> Result<Cluster, ClusterError> {
        Cluster::new(&self.cluster_name, config_file, &self.ssh_key)
    }

    pub fn executor(&self, cluster: &Cluster) -> Result<RemoteCommandExecutor<R>, ClusterError> {
        RemoteCommandExecutor::for_cluster(self.runner.clone(), cluster, &self.cloud)
    }

    /// Creates a bucket holding the pre/post install scripts of the test data dir under `scripts/`.
    pub fn scripts_bucket(&self, scripts: &[&str]) -> Result<ScriptsBucket<'_, C>, ScenarioError> {
        let name = unique_name("integ-tests-scripts");
        info!("Creating bucket {name} in {}", self.region);
        self.cloud.create_bucket(&name, &self.region)?;
        let bucket = ScriptsBucket {
            cloud: &self.cloud,
            name,
            region: self.region.clone(),
        };

        for script in scripts {
            bucket.upload(&self.test_datadir.join(script), &format!("scripts/{script}"))?;
        }
        Ok(bucket)
    }

    /// Instance backing the compute node `host` of the cluster stack.
    pub fn compute_instance(&self, cluster: &Cluster, host: &str) -> Result<Instance, ScenarioError> {
        let private_dns = format!("{host}.{}.compute.internal", self.region);
        self.cloud
            .find_instance(&cluster.stack_name(), &private_dns, &self.region)?
            .ok_or_else(|| ScenarioError::InstanceNotFound(host.to_string()))
    }

    pub fn wait(&self, delay: Duration, reason: &str) {
        info!("Waiting {delay:?} {reason}");
        (self.sleep)(delay);
    }
}

/// S3 bucket deleted with everything in it when dropped, even on panic.
pub struct ScriptsBucket<'a, C: CloudProvider> {
    cloud: &'a C,
    name: String,
    region: String,
}

impl<C: CloudProvider> ScriptsBucket<'_, C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn upload(&self, local_path: &Path, key: &str) -> Result<(), CloudError> {
        info!("Uploading {} to s3://{}/{key}", local_path.display(), self.name);
        self.cloud
            .upload_file(&self.name, local_path, key, &self.region)
    }
}

impl<C: CloudProvider> Drop for ScriptsBucket<'_, C> {
    fn drop(&mut self) {
        info!("Deleting bucket {}", self.name);
        if let Err(err) = self.cloud.delete_bucket(&self.name, &self.region) {
            error!("Failed when deleting bucket {} with exception {err}.", self.name);
        }
    }
}

/// `<prefix>-<timestamp>`, lowercase so it is valid for clusters and buckets alike.
pub fn unique_name(prefix: &str) -> String {
    format!(
        "{}-{}",
        prefix.to_lowercase(),
        chrono::Local::now().format("%Y%m%d%H%M%S%3f")
    )
}
