use std::process;

use clap::Parser;
use tracing::{error, info};

use pcluster_integ::cli::{Cli, Scenario};
use pcluster_integ::logging::Logging;
use pcluster_integ::scenarios::update::{
    update_awsbatch, update_hit, update_sit, AWSBATCH_DIMENSIONS, HIT_DIMENSIONS, SIT_DIMENSIONS,
};
use pcluster_integ::scenarios::ScenarioContext;

fn main() {
    let cli = Cli::parse();

    if let Err(err) = Logging::try_init(&cli.log_level) {
        eprintln!("{err}");
        process::exit(1);
    }

    let result = match cli.scenario {
        Scenario::UpdateSit(args) => {
            info!("Running update-sit scenario");
            update_sit(&ScenarioContext::from_args(args, SIT_DIMENSIONS))
        }
        Scenario::UpdateHit(args) => {
            info!("Running update-hit scenario");
            update_hit(&ScenarioContext::from_args(args, HIT_DIMENSIONS))
        }
        Scenario::UpdateAwsbatch(args) => {
            info!("Running update-awsbatch scenario");
            update_awsbatch(&ScenarioContext::from_args(args, AWSBATCH_DIMENSIONS))
        }
    };

    if let Err(err) = result {
        error!("Scenario failed: {err}");
        process::exit(1);
    }
    info!("Scenario succeeded");
}
