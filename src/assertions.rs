use std::collections::BTreeMap;
use std::fmt::Debug;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::cloud::{CloudError, CloudProvider, Instance};
use crate::cluster::{Cluster, ClusterError};

pub const ROOT_ROLE_RESOURCE: &str = "RootRole";
pub const S3_READ_POLICY: &str = "S3Read";
pub const S3_READ_WRITE_POLICY: &str = "S3ReadWrite";

#[derive(Error, Debug)]
pub enum AssertionError {
    #[error("{what}: expected `{expected}`, got `{actual}`")]
    Mismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("cloud provider lookup failed: `{0}`")]
    Cloud(#[from] CloudError),

    #[error("cluster lookup failed: `{0}`")]
    Cluster(#[from] ClusterError),

    #[error("invalid pattern: `{0}`")]
    Pattern(#[from] regex::Error),
}

/// Checks that `actual == expected`, describing the check as `what`.
pub fn assert_equal<T>(what: impl Into<String>, actual: T, expected: T) -> Result<(), AssertionError>
where
    T: PartialEq + Debug,
{
    if actual == expected {
        return Ok(());
    }
    Err(AssertionError::Mismatch {
        what: what.into(),
        expected: format!("{expected:?}"),
        actual: format!("{actual:?}"),
    })
}

/// Checks that `pattern` is found somewhere in `actual`.
pub fn assert_matches_pattern(
    what: impl Into<String>,
    actual: &str,
    pattern: &str,
) -> Result<(), AssertionError> {
    if Regex::new(pattern)?.is_match(actual) {
        return Ok(());
    }
    Err(AssertionError::Mismatch {
        what: what.into(),
        expected: format!("match for /{pattern}/"),
        actual: actual.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeType {
    OnDemand,
    Spot,
}

impl ComputeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeType::OnDemand => "ondemand",
            ComputeType::Spot => "spot",
        }
    }
}

/// Expected state of one compute resource of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeResourceExpectation {
    pub instance_type: String,
    pub expected_running_instances: usize,
    pub expected_power_saved_instances: usize,
    pub enable_efa: bool,
    pub disable_hyperthreading: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueExpectation {
    pub compute_type: ComputeType,
    pub compute_resources: BTreeMap<String, ComputeResourceExpectation>,
}

/// Queue name to its expected configuration.
pub type QueuesExpectation = BTreeMap<String, QueueExpectation>;

/// Counts running (`idle`) and power saved (`idle~`) scheduler nodes per compute resource.
pub fn assert_scheduler_nodes(
    queues: &QueuesExpectation,
    nodes_status: &BTreeMap<String, String>,
) -> Result<(), AssertionError> {
    info!("Checking scheduler nodes");
    let nodes: String = nodes_status
        .iter()
        .map(|(node, state)| format!("{node} {state}\n"))
        .collect();

    for (queue, queue_config) in queues {
        for resource in queue_config.compute_resources.values() {
            let instance_type = regex::escape(&resource.instance_type.replace('.', ""));
            let prefix = format!(r"{}-(dy|st)-{instance_type}-\d+", regex::escape(queue));

            let running = Regex::new(&format!(r"{prefix} idle\n"))?
                .find_iter(&nodes)
                .count();
            let power_saved = Regex::new(&format!(r"{prefix} idle~\n"))?
                .find_iter(&nodes)
                .count();

            assert_equal(
                format!("running {} nodes in {queue}", resource.instance_type),
                running,
                resource.expected_running_instances,
            )?;
            assert_equal(
                format!("power saved {} nodes in {queue}", resource.instance_type),
                power_saved,
                resource.expected_power_saved_instances,
            )?;
        }
    }
    Ok(())
}

/// Checks the nodes of `partition` right after the compute fleet started: the
/// static nodes are all up and idle, only `dynamic_nodes` dynamic nodes are not
/// power saved.
pub fn assert_initial_conditions(
    nodes_status: &BTreeMap<String, String>,
    static_nodes: usize,
    dynamic_nodes: usize,
    partition: &str,
) -> Result<(), AssertionError> {
    let static_prefix = format!("{partition}-st-");
    let dynamic_prefix = format!("{partition}-dy-");

    let statics: Vec<(&String, &String)> = nodes_status
        .iter()
        .filter(|(node, _)| node.starts_with(&static_prefix))
        .collect();
    assert_equal(format!("static nodes in {partition}"), statics.len(), static_nodes)?;
    for (node, state) in statics {
        assert_equal(format!("{node} state"), state.as_str(), "idle")?;
    }

    let running_dynamics = nodes_status
        .iter()
        .filter(|(node, state)| node.starts_with(&dynamic_prefix) && !state.ends_with('~'))
        .count();
    assert_equal(
        format!("running dynamic nodes in {partition}"),
        running_dynamics,
        dynamic_nodes,
    )
}

/// Name of the launch template of a queue compute resource.
pub fn launch_template_name(cluster_name: &str, queue: &str, instance_type: &str) -> String {
    format!("{cluster_name}-{queue}-{instance_type}")
}

pub fn assert_launch_templates<C>(
    cloud: &C,
    queues: &QueuesExpectation,
    cluster_name: &str,
    region: &str,
) -> Result<(), AssertionError>
where
    C: CloudProvider + ?Sized,
{
    info!("Checking launch templates");
    for (queue, queue_config) in queues {
        for resource in queue_config.compute_resources.values() {
            let name = launch_template_name(cluster_name, queue, &resource.instance_type);
            info!("Validating LaunchTemplate: {name}");
            let data = cloud.latest_launch_template_data(&name, region)?;
            assert_launch_template_data(&name, &data, queue_config.compute_type, resource)?;
        }
    }
    Ok(())
}

/// Checks market options, instance type, cpu options and network interfaces of a template.
pub fn assert_launch_template_data(
    name: &str,
    data: &Value,
    compute_type: ComputeType,
    resource: &ComputeResourceExpectation,
) -> Result<(), AssertionError> {
    match compute_type {
        ComputeType::Spot => assert_equal(
            format!("{name} market type"),
            data.pointer("/InstanceMarketOptions/MarketType"),
            Some(&Value::from(compute_type.as_str())),
        )?,
        ComputeType::OnDemand => assert_absent(name, data, "InstanceMarketOptions")?,
    }

    assert_equal(
        format!("{name} instance type"),
        data.get("InstanceType"),
        Some(&Value::from(resource.instance_type.as_str())),
    )?;

    if resource.disable_hyperthreading {
        assert_equal(
            format!("{name} threads per core"),
            data.pointer("/CpuOptions/ThreadsPerCore"),
            Some(&Value::from(1)),
        )?;
    } else {
        assert_absent(name, data, "CpuOptions")?;
    }

    let interface = data.pointer("/NetworkInterfaces/0").unwrap_or(&Value::Null);
    if resource.enable_efa {
        assert_equal(
            format!("{name} interface type"),
            interface.get("InterfaceType"),
            Some(&Value::from("efa")),
        )?;
    } else {
        assert_absent(&format!("{name} first network interface"), interface, "InterfaceType")?;
    }
    Ok(())
}

fn assert_absent(name: &str, data: &Value, key: &str) -> Result<(), AssertionError> {
    match data.get(key) {
        None => Ok(()),
        Some(value) => Err(AssertionError::Mismatch {
            what: format!("{name} {key}"),
            expected: "absent".to_string(),
            actual: value.to_string(),
        }),
    }
}

/// Initial queue size is the min size of the compute auto scaling group.
pub fn assert_initial_queue<C>(
    cloud: &C,
    stack_name: &str,
    region: &str,
    queue_size: i64,
) -> Result<(), AssertionError>
where
    C: CloudProvider + ?Sized,
{
    let capacity = cloud.asg_capacity(stack_name, region)?;
    assert_equal("asg min size", capacity.min, queue_size)
}

/// Max queue size is the max size of the compute auto scaling group.
pub fn assert_max_queue<C>(
    cloud: &C,
    stack_name: &str,
    region: &str,
    queue_size: i64,
) -> Result<(), AssertionError>
where
    C: CloudProvider + ?Sized,
{
    let capacity = cloud.asg_capacity(stack_name, region)?;
    assert_equal("asg max size", capacity.max, queue_size)
}

pub fn assert_batch_vcpus<C>(
    cloud: &C,
    compute_environment: &str,
    region: &str,
    min_vcpus: i64,
    max_vcpus: i64,
) -> Result<(), AssertionError>
where
    C: CloudProvider + ?Sized,
{
    let capacity = cloud.batch_ce_capacity(compute_environment, region)?;
    assert_equal("batch min vcpus", capacity.min, min_vcpus)?;
    assert_equal("batch max vcpus", capacity.max, max_vcpus)
}

pub fn assert_role_inline_policy<C>(
    cloud: &C,
    cluster: &Cluster,
    policy_name: &str,
    expected_resource: &str,
) -> Result<(), AssertionError>
where
    C: CloudProvider + ?Sized,
{
    let root_role = cluster.stack_resource(cloud, ROOT_ROLE_RESOURCE)?;
    let resource = cloud.role_inline_policy_resource(&root_role, policy_name, cluster.region())?;
    assert_equal(
        format!("{policy_name} policy resource"),
        resource.as_str(),
        expected_resource,
    )
}

pub fn assert_s3_read_resource<C>(
    cloud: &C,
    cluster: &Cluster,
    s3_arn: &str,
) -> Result<(), AssertionError>
where
    C: CloudProvider + ?Sized,
{
    assert_role_inline_policy(cloud, cluster, S3_READ_POLICY, s3_arn)
}

pub fn assert_s3_read_write_resource<C>(
    cloud: &C,
    cluster: &Cluster,
    s3_arn: &str,
) -> Result<(), AssertionError>
where
    C: CloudProvider + ?Sized,
{
    assert_role_inline_policy(cloud, cluster, S3_READ_WRITE_POLICY, s3_arn)
}

pub fn assert_role_attached_policy<C>(
    cloud: &C,
    cluster: &Cluster,
    policy_arn: &str,
) -> Result<(), AssertionError>
where
    C: CloudProvider + ?Sized,
{
    let root_role = cluster.stack_resource(cloud, ROOT_ROLE_RESOURCE)?;
    let policies = cloud.role_attached_policies(&root_role, cluster.region())?;
    if policies.iter().any(|p| p == policy_arn) {
        return Ok(());
    }
    Err(AssertionError::Mismatch {
        what: format!("policies attached to {root_role}"),
        expected: format!("to contain {policy_arn}"),
        actual: policies.join(", "),
    })
}

pub fn assert_instance_type(instance: &Instance, instance_type: &str) -> Result<(), AssertionError> {
    assert_equal(
        format!("{} instance type", instance.instance_id),
        instance.instance_type.as_str(),
        instance_type,
    )
}

pub fn assert_spot_instance(instance: &Instance) -> Result<(), AssertionError> {
    assert_equal(
        format!("{} lifecycle", instance.instance_id),
        instance.lifecycle.as_deref(),
        Some("spot"),
    )
}

pub fn assert_ondemand_instance(instance: &Instance) -> Result<(), AssertionError> {
    assert_equal(
        format!("{} lifecycle", instance.instance_id),
        instance.lifecycle.as_deref(),
        None,
    )
}
