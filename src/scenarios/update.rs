use std::collections::BTreeMap;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::info;

use super::{Dimensions, ScenarioContext, ScenarioError};
use crate::assertions::{
    assert_batch_vcpus, assert_equal, assert_initial_conditions, assert_initial_queue,
    assert_instance_type, assert_launch_templates, assert_matches_pattern, assert_max_queue,
    assert_ondemand_instance, assert_role_attached_policy, assert_s3_read_resource,
    assert_s3_read_write_resource, assert_scheduler_nodes, assert_spot_instance,
    ComputeResourceExpectation, ComputeType, QueueExpectation, QueuesExpectation,
};
use crate::cloud::CloudProvider;
use crate::cluster::Cluster;
use crate::command::CommandRunner;
use crate::config::ClusterConfig;
use crate::remote::RemoteCommandExecutor;
use crate::scheduler::{scheduler_commands, JobOptions, SchedulerCommands};

pub const SIT_DIMENSIONS: Dimensions = Dimensions {
    region: "us-west-2",
    instance: "c5.xlarge",
    os: "centos7",
    scheduler: "sge",
};

pub const HIT_DIMENSIONS: Dimensions = Dimensions {
    region: "us-west-1",
    instance: "c5.xlarge",
    os: "alinux2",
    scheduler: "slurm",
};

pub const AWSBATCH_DIMENSIONS: Dimensions = Dimensions {
    region: "eu-west-1",
    instance: "c5.xlarge",
    os: "alinux2",
    scheduler: "awsbatch",
};

const UPDATE_CONFIG_TEMPLATE: &str = "pcluster.config.update.ini";
const INSTALL_SCRIPTS: [&str; 2] = ["preinstall.sh", "postinstall.sh"];
const ROOT_VOLUME_SIZE_SCRIPT: &str = "slurm_get_root_volume_size.sh";
const COMPUTE_ENVIRONMENT_RESOURCE: &str = "ComputeEnvironment";

const CLUSTER_STOP_WAIT: Duration = Duration::from_secs(60);
const CLUSTER_START_WAIT: Duration = Duration::from_secs(90);
const RESULT_FILE_WAIT: Duration = Duration::from_secs(5);

fn bucket_param(bucket: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("bucket".to_string(), bucket.to_string())])
}

/// Single instance type cluster update.
pub fn update_sit<R, C>(ctx: &ScenarioContext<R, C>) -> Result<(), ScenarioError>
where
    R: CommandRunner + Clone,
    C: CloudProvider,
{
    let bucket = ctx.scripts_bucket(&INSTALL_SCRIPTS)?;
    let mut factory = ctx.clusters_factory();
    let pcluster = ctx.pcluster();

    let init_config_file = ctx.reader.render_default()?;
    let cluster = factory.create(ctx.cluster(&init_config_file)?)?;
    let init_config = cluster.config().clone();

    // same config, must not fail even without force
    cluster.update(&pcluster, false)?;

    let executor = ctx.executor(cluster)?;
    let scheduler = scheduler_commands(&ctx.scheduler, &executor)?;
    executor.run_remote_command("mkdir /shared/script_results")?;

    let updated_config_file = ctx
        .reader
        .render(UPDATE_CONFIG_TEMPLATE, &bucket_param(bucket.name()))?;
    cluster.set_config_file(&updated_config_file)?;
    cluster.update(&pcluster, true)?;

    // some changes only apply to compute nodes launched after the update
    let initial_compute_nodes = scheduler.get_compute_nodes()?;
    let slots_per_instance = ctx.cloud.instance_vcpus(&ctx.instance, &ctx.region)?;
    let new_compute_nodes = add_compute_nodes(scheduler.as_ref(), slots_per_instance, 1)?;

    let old_compute_node = initial_compute_nodes
        .first()
        .ok_or_else(|| ScenarioError::NoComputeNodes(cluster.name().to_string()))?;
    let new_compute_node = new_compute_nodes
        .first()
        .ok_or_else(|| ScenarioError::NoNewComputeNodes(cluster.name().to_string()))?;
    let old_compute_instance = ctx.compute_instance(cluster, old_compute_node)?;
    let new_compute_instance = ctx.compute_instance(cluster, new_compute_node)?;

    let updated_config = cluster.config();
    let init_section = init_config.cluster_section();
    let section = updated_config.cluster_section();
    let stack_name = cluster.stack_name();

    assert_initial_queue(
        &ctx.cloud,
        &stack_name,
        &ctx.region,
        updated_config.get_int(&section, "initial_queue_size")?,
    )?;
    assert_max_queue(
        &ctx.cloud,
        &stack_name,
        &ctx.region,
        updated_config.get_int(&section, "max_queue_size")?,
    )?;

    assert_s3_read_resource(
        &ctx.cloud,
        cluster,
        updated_config.require(&section, "s3_read_resource")?,
    )?;
    assert_s3_read_write_resource(
        &ctx.cloud,
        cluster,
        updated_config.require(&section, "s3_read_write_resource")?,
    )?;
    assert_role_attached_policy(
        &ctx.cloud,
        cluster,
        updated_config.require(&section, "additional_iam_policies")?,
    )?;

    assert_instance_type(
        &old_compute_instance,
        init_config.require(&init_section, "compute_instance_type")?,
    )?;
    assert_instance_type(
        &new_compute_instance,
        updated_config.require(&section, "compute_instance_type")?,
    )?;
    assert_ondemand_instance(&old_compute_instance)?;
    assert_spot_instance(&new_compute_instance)?;

    let checks = NodeChecks::new(&executor, scheduler.as_ref()).with_sleep(ctx.sleep);
    checks.compute_root_volume_size(
        &ctx.test_datadir,
        init_config.require(&init_section, "compute_root_volume_size")?,
        old_compute_node,
    )?;
    checks.compute_root_volume_size(
        &ctx.test_datadir,
        updated_config.require(&section, "compute_root_volume_size")?,
        new_compute_node,
    )?;

    checks.extra_json(old_compute_node, "test_value_1")?;
    checks.extra_json(new_compute_node, "test_value_2")?;

    checks.script(
        new_compute_node,
        "preinstall",
        updated_config.require(&section, "pre_install_args")?,
    )?;
    checks.script(
        new_compute_node,
        "postinstall",
        updated_config.require(&section, "post_install_args")?,
    )?;

    info!("Cluster {} updated and checked", cluster.name());
    Ok(())
}

/// Multi queue Slurm cluster update, the compute fleet is stopped while updating.
pub fn update_hit<R, C>(ctx: &ScenarioContext<R, C>) -> Result<(), ScenarioError>
where
    R: CommandRunner + Clone,
    C: CloudProvider,
{
    let bucket = ctx.scripts_bucket(&INSTALL_SCRIPTS)?;
    let mut factory = ctx.clusters_factory();
    let pcluster = ctx.pcluster();

    let init_config_file = ctx.reader.render_default()?;
    let cluster = factory.create(ctx.cluster(&init_config_file)?)?;

    cluster.update(&pcluster, false)?;

    let executor = ctx.executor(cluster)?;
    let scheduler = scheduler_commands(&ctx.scheduler, &executor)?;
    executor.run_remote_command("mkdir -p /shared/script_results")?;

    let initial_queues = hit_initial_queues();
    assert_scheduler_nodes(&initial_queues, &scheduler.get_nodes_status()?)?;
    assert_launch_templates(&ctx.cloud, &initial_queues, cluster.name(), &ctx.region)?;

    let updated_config_file = ctx
        .reader
        .render(UPDATE_CONFIG_TEMPLATE, &bucket_param(bucket.name()))?;
    cluster.set_config_file(&updated_config_file)?;
    cluster.stop(&pcluster)?;
    ctx.wait(CLUSTER_STOP_WAIT, "for the cluster to stop");
    cluster.update(&pcluster, true)?;
    cluster.start(&pcluster)?;
    ctx.wait(CLUSTER_START_WAIT, "for the cluster to start");

    assert_initial_conditions(&scheduler.get_nodes_status()?, 1, 0, "queue1")?;

    let updated_queues = hit_updated_queues();
    assert_scheduler_nodes(&updated_queues, &scheduler.get_nodes_status()?)?;
    assert_launch_templates(&ctx.cloud, &updated_queues, cluster.name(), &ctx.region)?;

    let updated_config = cluster.config();
    let section = updated_config.cluster_section();
    assert_s3_read_resource(
        &ctx.cloud,
        cluster,
        updated_config.require(&section, "s3_read_resource")?,
    )?;
    assert_s3_read_write_resource(
        &ctx.cloud,
        cluster,
        updated_config.require(&section, "s3_read_write_resource")?,
    )?;
    assert_role_attached_policy(
        &ctx.cloud,
        cluster,
        updated_config.require(&section, "additional_iam_policies")?,
    )?;

    info!("Cluster {} updated and checked", cluster.name());
    Ok(())
}

/// AWS Batch cluster update, only the compute environment vCPUs are checked.
pub fn update_awsbatch<R, C>(ctx: &ScenarioContext<R, C>) -> Result<(), ScenarioError>
where
    R: CommandRunner + Clone,
    C: CloudProvider,
{
    let mut factory = ctx.clusters_factory();
    let pcluster = ctx.pcluster();

    let init_config_file = ctx.reader.render_default()?;
    let cluster = factory.create(ctx.cluster(&init_config_file)?)?;
    verify_batch_vcpus(&ctx.cloud, cluster, &ctx.region)?;

    cluster.update(&pcluster, false)?;

    let updated_config_file = ctx
        .reader
        .render(UPDATE_CONFIG_TEMPLATE, &BTreeMap::new())?;
    cluster.set_config_file(&updated_config_file)?;
    cluster.update(&pcluster, true)?;

    verify_batch_vcpus(&ctx.cloud, cluster, &ctx.region)?;

    info!("Cluster {} updated and checked", cluster.name());
    Ok(())
}

/// Compares the compute environment vCPUs with the current config of `cluster`.
fn verify_batch_vcpus<C>(cloud: &C, cluster: &Cluster, region: &str) -> Result<(), ScenarioError>
where
    C: CloudProvider,
{
    let config: &ClusterConfig = cluster.config();
    let section = config.cluster_section();
    let compute_environment = cluster.stack_resource(cloud, COMPUTE_ENVIRONMENT_RESOURCE)?;
    assert_batch_vcpus(
        cloud,
        &compute_environment,
        region,
        config.get_int(&section, "min_vcpus")?,
        config.get_int(&section, "max_vcpus")?,
    )?;
    Ok(())
}

/// Scales the cluster up by `number_of_nodes` with a job spanning every node.
///
/// Returns the new compute nodes only.
pub fn add_compute_nodes(
    scheduler: &dyn SchedulerCommands,
    slots_per_node: u32,
    number_of_nodes: u32,
) -> Result<Vec<String>, ScenarioError> {
    let initial_compute_nodes = scheduler.get_compute_nodes()?;

    let options = JobOptions {
        nodes: u32::try_from(initial_compute_nodes.len())
            .unwrap_or(u32::MAX)
            .saturating_add(number_of_nodes),
        slots: Some(slots_per_node),
        host: None,
    };
    info!(nodes = options.nodes, "Submitting a job to add compute nodes");
    scheduler.run_job("sleep 1", &options)?;

    Ok(scheduler
        .get_compute_nodes()?
        .into_iter()
        .filter(|node| !initial_compute_nodes.contains(node))
        .collect())
}

/// Checks run on a given compute node through a job, results are read back from `/shared`.
pub struct NodeChecks<'a, R> {
    executor: &'a RemoteCommandExecutor<R>,
    scheduler: &'a dyn SchedulerCommands,
    result_file_wait: Duration,
    sleep: fn(Duration),
}

impl<'a, R: CommandRunner> NodeChecks<'a, R> {
    pub fn new(executor: &'a RemoteCommandExecutor<R>, scheduler: &'a dyn SchedulerCommands) -> Self {
        Self {
            executor,
            scheduler,
            result_file_wait: RESULT_FILE_WAIT,
            sleep: thread::sleep,
        }
    }

    pub fn with_sleep(self, sleep: fn(Duration)) -> Self {
        Self { sleep, ..self }
    }

    fn read_shared_file(&self, path: &str) -> Result<String, ScenarioError> {
        // the job output may take a moment to show up on the master node
        (self.sleep)(self.result_file_wait);
        Ok(self
            .executor
            .run_remote_command(&format!("cat {path}"))?
            .stdout)
    }

    pub fn compute_root_volume_size(
        &self,
        test_datadir: &Path,
        compute_root_volume_size: &str,
        host: &str,
    ) -> Result<(), ScenarioError> {
        let script = test_datadir.join(ROOT_VOLUME_SIZE_SCRIPT);
        let output = self.scheduler.submit_script(&script, Some(host))?;
        let job_id = self.scheduler.assert_job_submitted(&output.stdout)?;
        self.scheduler.wait_job_completed(&job_id)?;
        self.scheduler.assert_job_succeeded(&job_id)?;

        let size = self.read_shared_file(&format!("/shared/{host}_root_volume_size.txt"))?;
        assert_matches_pattern(
            format!("{host} root volume size"),
            &size,
            &format!("{compute_root_volume_size}G"),
        )?;
        Ok(())
    }

    /// Value of the `test_key` custom key set through `extra_json`.
    pub fn extra_json(&self, host: &str, expected_value: &str) -> Result<(), ScenarioError> {
        let command = format!("jq .test_key /etc/chef/dna.json > /shared/{host}_extra_json.txt");
        self.scheduler
            .run_job(&command, &JobOptions::on_host(host))?;

        let value = self.read_shared_file(&format!("/shared/{host}_extra_json.txt"))?;
        assert_equal(
            format!("{host} extra json test_key"),
            value.trim(),
            format!("\"{expected_value}\"").as_str(),
        )?;
        Ok(())
    }

    /// Output a pre or post install script left in `/tmp`.
    pub fn script(&self, host: &str, script_name: &str, script_arg: &str) -> Result<(), ScenarioError> {
        let result_file = format!("/shared/script_results/{host}_{script_name}_out.txt");
        let command = format!("cp /tmp/{script_name}_out.txt {result_file}");
        self.scheduler
            .run_job(&command, &JobOptions::on_host(host))?;

        let output = self.read_shared_file(&result_file)?;
        assert_matches_pattern(
            format!("{host} {script_name} output"),
            &output,
            &format!("{script_name}-{script_arg}"),
        )?;
        Ok(())
    }
}

fn compute_resource(
    instance_type: &str,
    expected_running_instances: usize,
    expected_power_saved_instances: usize,
    disable_hyperthreading: bool,
    enable_efa: bool,
) -> ComputeResourceExpectation {
    ComputeResourceExpectation {
        instance_type: instance_type.to_string(),
        expected_running_instances,
        expected_power_saved_instances,
        enable_efa,
        disable_hyperthreading,
    }
}

fn queue<const N: usize>(
    compute_type: ComputeType,
    compute_resources: [(&str, ComputeResourceExpectation); N],
) -> QueueExpectation {
    QueueExpectation {
        compute_type,
        compute_resources: compute_resources
            .into_iter()
            .map(|(name, resource)| (name.to_string(), resource))
            .collect(),
    }
}

fn hit_initial_queues() -> QueuesExpectation {
    QueuesExpectation::from([(
        "queue1".to_string(),
        queue(
            ComputeType::OnDemand,
            [
                ("queue1_i1", compute_resource("c5.xlarge", 1, 1, false, false)),
                ("queue1_i2", compute_resource("t2.micro", 1, 9, false, false)),
            ],
        ),
    )])
}

fn hit_updated_queues() -> QueuesExpectation {
    QueuesExpectation::from([
        (
            "queue1".to_string(),
            queue(
                ComputeType::Spot,
                [
                    ("queue1_i1", compute_resource("c5.xlarge", 1, 1, true, false)),
                    ("queue1_i2", compute_resource("c5.2xlarge", 0, 10, true, false)),
                    ("queue1_i3", compute_resource("t2.micro", 0, 10, false, false)),
                ],
            ),
        ),
        (
            "queue2".to_string(),
            queue(
                ComputeType::OnDemand,
                [
                    ("queue2_i1", compute_resource("c5n.18xlarge", 0, 10, true, true)),
                    ("queue2_i2", compute_resource("t2.xlarge", 0, 10, false, false)),
                ],
            ),
        ),
    ])
}
