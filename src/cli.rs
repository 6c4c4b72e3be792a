use std::collections::BTreeMap;

use clap::Parser;

use crate::logging::DEFAULT_LOG_LEVEL;
use crate::scenarios::ScenarioArgs;

#[derive(Debug, clap::Subcommand)]
pub enum Scenario {
    /// Single instance type cluster. Updates queue sizes, S3 and IAM settings, compute
    /// instance type, root volume, extra json and pre/post install scripts, then checks
    /// them on an old and a freshly added compute node.
    UpdateSit(ScenarioArgs),
    /// Multi queue Slurm cluster. Stops the fleet, adds queues and compute resources,
    /// starts it again and checks scheduler nodes and launch templates.
    UpdateHit(ScenarioArgs),
    /// AWS Batch cluster. Checks min and max vCPUs of the compute environment before
    /// and after the update.
    UpdateAwsbatch(ScenarioArgs),
}

#[derive(Debug, Parser)]
#[command(
    name = "pcluster-integ",
    about = "Integration test runner for ParallelCluster cluster updates",
    long_about = "This tool creates ParallelCluster clusters, updates them and checks the result.\n
PREREQUISITES:
- pcluster and aws CLIs in PATH
- AWS credentials for the target account"
)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    #[command(subcommand)]
    pub scenario: Scenario,
}

/// Parses a string of key-value pairs separated by commas.
///
/// The equal sign character `=` is used to separate the key from the value,
/// and the comma character `,` to separate the pairs. Invalid pairs are skipped.
///
/// # Examples
///
/// ```
/// use std::collections::BTreeMap;
/// use pcluster_integ::cli::parse_key_value_pairs;
///
/// let parsed = parse_key_value_pairs("vpc_id=vpc-1, public_subnet_id=subnet-2");
/// assert_eq!(parsed, BTreeMap::from([
///     ("public_subnet_id".to_string(), "subnet-2".to_string()),
///     ("vpc_id".to_string(), "vpc-1".to_string()),
/// ]));
/// ```
pub fn parse_key_value_pairs(data: &str) -> BTreeMap<String, String> {
    let pairs = data.split(',');
    let key_values = pairs.map(|pair| pair.split_once('='));
    let valid_key_values = key_values.flatten();

    valid_key_values
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Value parser of `--param`, at least one valid pair is required.
pub fn parse_params(data: &str) -> Result<BTreeMap<String, String>, String> {
    let params = parse_key_value_pairs(data);
    if params.is_empty() {
        return Err(format!("expected key=value pairs, got `{data}`"));
    }
    Ok(params)
}
