use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{Capacity, CloudError, CloudProvider, Instance, StackOutputs, StackResources};
use crate::command::{CommandLine, CommandRunner};

const AWS_BINARY: &str = "aws";

/// [CloudProvider] backed by the `aws` command line tool with JSON output.
pub struct AwsCli<R> {
    runner: R,
}

impl<R: CommandRunner> AwsCli<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    fn command<I, S>(service: &str, operation: &str, region: &str, args: I) -> CommandLine
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandLine::new(AWS_BINARY)
            .args([service, operation])
            .args(args)
            .args(["--region", region, "--output", "json"])
    }

    fn query<T: DeserializeOwned>(&self, command: CommandLine) -> Result<T, CloudError> {
        let output = self.runner.run(&command)?;
        debug!(%command, "parsing cloud provider response");
        serde_json::from_str(&output.stdout).map_err(|source| CloudError::Parse {
            command: command.to_string(),
            source,
        })
    }

    fn execute(&self, command: CommandLine) -> Result<(), CloudError> {
        self.runner.run(&command)?;
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStacks {
    stacks: Vec<Stack>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Stack {
    #[serde(default)]
    outputs: Vec<StackOutput>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackOutput {
    output_key: String,
    output_value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStackResources {
    stack_resources: Vec<StackResource>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackResource {
    logical_resource_id: String,
    #[serde(default)]
    physical_resource_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeAutoScalingGroups {
    auto_scaling_groups: Vec<AutoScalingGroup>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AutoScalingGroup {
    min_size: i64,
    max_size: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeComputeEnvironments {
    compute_environments: Vec<ComputeEnvironment>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComputeEnvironment {
    compute_resources: ComputeResources,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComputeResources {
    minv_cpus: i64,
    maxv_cpus: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeLaunchTemplateVersions {
    launch_template_versions: Vec<LaunchTemplateVersion>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LaunchTemplateVersion {
    launch_template_data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    reservations: Vec<Reservation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    instances: Vec<Ec2Instance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Instance {
    instance_id: String,
    instance_type: String,
    instance_lifecycle: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetRolePolicy {
    policy_document: PolicyDocument,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PolicyDocument {
    statement: Vec<PolicyStatement>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PolicyStatement {
    resource: OneOrMany,
}

/// IAM accepts a single string or a list wherever a list of values is expected.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn first(self) -> Option<String> {
        match self {
            OneOrMany::One(value) => Some(value),
            OneOrMany::Many(values) => values.into_iter().next(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListAttachedRolePolicies {
    attached_policies: Vec<AttachedPolicy>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachedPolicy {
    policy_arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstanceTypes {
    instance_types: Vec<InstanceTypeInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceTypeInfo {
    v_cpu_info: VCpuInfo,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VCpuInfo {
    default_v_cpus: u32,
}

impl<R: CommandRunner> CloudProvider for AwsCli<R> {
    fn stack_outputs(&self, stack_name: &str, region: &str) -> Result<StackOutputs, CloudError> {
        let response: DescribeStacks = self.query(Self::command(
            "cloudformation",
            "describe-stacks",
            region,
            ["--stack-name", stack_name],
        ))?;
        let stack = response
            .stacks
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::NotFound(format!("stack {stack_name}")))?;
        Ok(stack
            .outputs
            .into_iter()
            .map(|o| (o.output_key, o.output_value))
            .collect())
    }

    fn stack_resources(
        &self,
        stack_name: &str,
        region: &str,
    ) -> Result<StackResources, CloudError> {
        let response: DescribeStackResources = self.query(Self::command(
            "cloudformation",
            "describe-stack-resources",
            region,
            ["--stack-name", stack_name],
        ))?;
        Ok(response
            .stack_resources
            .into_iter()
            .map(|r| (r.logical_resource_id, r.physical_resource_id))
            .collect())
    }

    fn asg_capacity(&self, stack_name: &str, region: &str) -> Result<Capacity, CloudError> {
        let response: DescribeAutoScalingGroups = self.query(Self::command(
            "autoscaling",
            "describe-auto-scaling-groups",
            region,
            [
                "--filters".to_string(),
                format!("Name=tag:Application,Values={stack_name}"),
            ],
        ))?;
        let asg = response
            .auto_scaling_groups
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::NotFound(format!("auto scaling group of {stack_name}")))?;
        Ok(Capacity {
            min: asg.min_size,
            max: asg.max_size,
        })
    }

    fn batch_ce_capacity(
        &self,
        compute_environment: &str,
        region: &str,
    ) -> Result<Capacity, CloudError> {
        let response: DescribeComputeEnvironments = self.query(Self::command(
            "batch",
            "describe-compute-environments",
            region,
            ["--compute-environments", compute_environment],
        ))?;
        let ce = response
            .compute_environments
            .into_iter()
            .next()
            .ok_or_else(|| {
                CloudError::NotFound(format!("compute environment {compute_environment}"))
            })?;
        Ok(Capacity {
            min: ce.compute_resources.minv_cpus,
            max: ce.compute_resources.maxv_cpus,
        })
    }

    fn latest_launch_template_data(
        &self,
        launch_template_name: &str,
        region: &str,
    ) -> Result<Value, CloudError> {
        let response: DescribeLaunchTemplateVersions = self.query(Self::command(
            "ec2",
            "describe-launch-template-versions",
            region,
            [
                "--launch-template-name",
                launch_template_name,
                "--versions",
                "$Latest",
            ],
        ))?;
        response
            .launch_template_versions
            .into_iter()
            .next()
            .map(|v| v.launch_template_data)
            .ok_or_else(|| CloudError::NotFound(format!("launch template {launch_template_name}")))
    }

    fn find_instance(
        &self,
        stack_name: &str,
        private_dns_name: &str,
        region: &str,
    ) -> Result<Option<Instance>, CloudError> {
        let response: DescribeInstances = self.query(Self::command(
            "ec2",
            "describe-instances",
            region,
            [
                "--filters".to_string(),
                format!("Name=tag:Application,Values={stack_name}"),
                format!("Name=private-dns-name,Values={private_dns_name}"),
            ],
        ))?;
        Ok(response
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .next()
            .map(|i| Instance {
                instance_id: i.instance_id,
                instance_type: i.instance_type,
                lifecycle: i.instance_lifecycle,
            }))
    }

    fn role_inline_policy_resource(
        &self,
        role_name: &str,
        policy_name: &str,
        region: &str,
    ) -> Result<String, CloudError> {
        let response: GetRolePolicy = self.query(Self::command(
            "iam",
            "get-role-policy",
            region,
            ["--role-name", role_name, "--policy-name", policy_name],
        ))?;
        response
            .policy_document
            .statement
            .into_iter()
            .next()
            .and_then(|s| s.resource.first())
            .ok_or_else(|| CloudError::NotFound(format!("resource in {role_name}/{policy_name}")))
    }

    fn role_attached_policies(
        &self,
        role_name: &str,
        region: &str,
    ) -> Result<Vec<String>, CloudError> {
        let response: ListAttachedRolePolicies = self.query(Self::command(
            "iam",
            "list-attached-role-policies",
            region,
            ["--role-name", role_name],
        ))?;
        Ok(response
            .attached_policies
            .into_iter()
            .map(|p| p.policy_arn)
            .collect())
    }

    fn instance_vcpus(&self, instance_type: &str, region: &str) -> Result<u32, CloudError> {
        let response: DescribeInstanceTypes = self.query(Self::command(
            "ec2",
            "describe-instance-types",
            region,
            ["--instance-types", instance_type],
        ))?;
        response
            .instance_types
            .into_iter()
            .next()
            .map(|t| t.v_cpu_info.default_v_cpus)
            .ok_or_else(|| CloudError::NotFound(format!("instance type {instance_type}")))
    }

    fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), CloudError> {
        self.execute(Self::command("s3", "mb", region, [format!("s3://{bucket}")]))
    }

    fn upload_file(
        &self,
        bucket: &str,
        local_path: &Path,
        key: &str,
        region: &str,
    ) -> Result<(), CloudError> {
        self.execute(Self::command(
            "s3",
            "cp",
            region,
            [
                local_path.to_string_lossy().to_string(),
                format!("s3://{bucket}/{key}"),
            ],
        ))
    }

    fn delete_bucket(&self, bucket: &str, region: &str) -> Result<(), CloudError> {
        self.execute(Self::command(
            "s3",
            "rb",
            region,
            [format!("s3://{bucket}"), "--force".to_string()],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandError, CommandOutput, MockCommandRunner};
    use assert_matches::assert_matches;
    use mockall::predicate;

    fn cli_returning(expected: CommandLine, stdout: &'static str) -> AwsCli<MockCommandRunner> {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .once()
            .with(predicate::eq(expected))
            .returning(move |_| Ok(CommandOutput::from_stdout(stdout)));
        AwsCli::new(runner)
    }

    #[test]
    fn stack_outputs_are_mapped_by_key() {
        let expected = CommandLine::new("aws").args([
            "cloudformation",
            "describe-stacks",
            "--stack-name",
            "parallelcluster-test",
            "--region",
            "us-east-1",
            "--output",
            "json",
        ]);
        let cli = cli_returning(
            expected,
            r#"{"Stacks": [{"StackName": "parallelcluster-test", "Outputs": [
                {"OutputKey": "MasterPublicIP", "OutputValue": "54.1.2.3"},
                {"OutputKey": "MasterPrivateIP", "OutputValue": "10.0.0.4"}
            ]}]}"#,
        );

        let outputs = cli.stack_outputs("parallelcluster-test", "us-east-1").unwrap();
        assert_eq!(outputs.get("MasterPublicIP").map(String::as_str), Some("54.1.2.3"));
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn stack_without_outputs() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .once()
            .returning(|_| Ok(CommandOutput::from_stdout(r#"{"Stacks": [{"StackName": "s"}]}"#)));
        let outputs = AwsCli::new(runner).stack_outputs("s", "us-east-1").unwrap();
        assert!(outputs.is_empty());
    }

    #[test]
    fn asg_capacity_filters_by_application_tag() {
        let expected = CommandLine::new("aws").args([
            "autoscaling",
            "describe-auto-scaling-groups",
            "--filters",
            "Name=tag:Application,Values=parallelcluster-sit",
            "--region",
            "us-west-2",
            "--output",
            "json",
        ]);
        let cli = cli_returning(
            expected,
            r#"{"AutoScalingGroups": [{"AutoScalingGroupName": "asg", "MinSize": 1, "MaxSize": 3, "DesiredCapacity": 1}]}"#,
        );
        assert_eq!(
            cli.asg_capacity("parallelcluster-sit", "us-west-2").unwrap(),
            Capacity { min: 1, max: 3 }
        );
    }

    #[test]
    fn missing_asg_is_not_found() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(CommandOutput::from_stdout(r#"{"AutoScalingGroups": []}"#)));
        assert_matches!(
            AwsCli::new(runner).asg_capacity("s", "r"),
            Err(CloudError::NotFound(_))
        );
    }

    #[test]
    fn batch_capacity() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(CommandOutput::from_stdout(
                r#"{"computeEnvironments": [{"computeEnvironmentName": "ce", "computeResources": {"minvCpus": 0, "maxvCpus": 40, "desiredvCpus": 0}}]}"#,
            ))
        });
        assert_eq!(
            AwsCli::new(runner).batch_ce_capacity("ce-arn", "eu-west-1").unwrap(),
            Capacity { min: 0, max: 40 }
        );
    }

    #[test]
    fn inline_policy_resource_as_string_or_list() {
        for document in [
            r#"{"RoleName": "r", "PolicyName": "S3Read", "PolicyDocument": {"Statement": [{"Effect": "Allow", "Resource": ["arn:aws:s3:::bucket/*"]}]}}"#,
            r#"{"RoleName": "r", "PolicyName": "S3Read", "PolicyDocument": {"Statement": [{"Effect": "Allow", "Resource": "arn:aws:s3:::bucket/*"}]}}"#,
        ] {
            let mut runner = MockCommandRunner::new();
            runner
                .expect_run()
                .returning(move |_| Ok(CommandOutput::from_stdout(document)));
            assert_eq!(
                AwsCli::new(runner)
                    .role_inline_policy_resource("r", "S3Read", "us-west-2")
                    .unwrap(),
                "arn:aws:s3:::bucket/*"
            );
        }
    }

    #[test]
    fn on_demand_instance_has_no_lifecycle() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(CommandOutput::from_stdout(
                r#"{"Reservations": [{"Instances": [{"InstanceId": "i-1", "InstanceType": "c5.xlarge"}]}]}"#,
            ))
        });
        assert_eq!(
            AwsCli::new(runner)
                .find_instance("s", "ip-10-0-0-1.us-west-2.compute.internal", "us-west-2")
                .unwrap(),
            Some(Instance {
                instance_id: "i-1".to_string(),
                instance_type: "c5.xlarge".to_string(),
                lifecycle: None,
            })
        );
    }

    #[test]
    fn no_matching_instance() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(CommandOutput::from_stdout(r#"{"Reservations": []}"#)));
        assert_eq!(AwsCli::new(runner).find_instance("s", "h", "r").unwrap(), None);
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(CommandOutput::from_stdout("not json")));
        assert_matches!(
            AwsCli::new(runner).instance_vcpus("c5.xlarge", "r"),
            Err(CloudError::Parse { .. })
        );
    }

    #[test]
    fn command_failures_are_propagated() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|c| {
            Err(CommandError::ExitStatus {
                command: c.to_string(),
                code: Some(255),
                stdout: String::new(),
                stderr: "AccessDenied".to_string(),
            })
        });
        assert_matches!(
            AwsCli::new(runner).role_attached_policies("r", "us-west-2"),
            Err(CloudError::Command(_))
        );
    }
}
