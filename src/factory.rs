use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cluster::Cluster;
use crate::command::pcluster::{CREATE_COMPLETE, DELETE_FAILED};
use crate::command::{CommandError, CommandRunner, Pcluster};
use crate::retry::RetryPolicy;

pub const DESTROY_MAX_ATTEMPTS: usize = 10;
pub const DESTROY_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum FactoryError {
    #[error("Cluster {0} already exists")]
    DuplicateName(String),

    #[error("Cluster creation failed for {name} with output: {output}")]
    CreationFailed { name: String, output: String },

    #[error("Cluster deletion failed for {name} with output: {output}")]
    DeletionFailed { name: String, output: String },

    #[error("pcluster invocation failed: `{0}`")]
    Command(#[from] CommandError),
}

impl FactoryError {
    /// Whether the command could not run at all, as opposed to reporting a failure.
    pub fn is_process_failure(&self) -> bool {
        matches!(self, FactoryError::Command(_))
    }
}

/// Manages creation and destruction of clusters.
///
/// A name in the registry denotes a cluster believed to exist. Destruction
/// removes it, so [ClustersFactory::destroy_all] only visits live clusters.
pub struct ClustersFactory<R> {
    pcluster: Pcluster<R>,
    destroy_policy: RetryPolicy,
    clusters: HashMap<String, Cluster>,
}

impl<R: CommandRunner> ClustersFactory<R> {
    pub fn new(pcluster: Pcluster<R>) -> Self {
        Self {
            pcluster,
            destroy_policy: RetryPolicy::fixed(DESTROY_MAX_ATTEMPTS, DESTROY_RETRY_DELAY),
            clusters: HashMap::new(),
        }
    }

    pub fn with_destroy_policy(self, destroy_policy: RetryPolicy) -> Self {
        Self {
            destroy_policy,
            ..self
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clusters.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Cluster> {
        self.clusters.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cluster> {
        self.clusters.get_mut(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.clusters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Creates the cluster and registers it once `pcluster` reports completion.
    pub fn create(&mut self, cluster: Cluster) -> Result<&mut Cluster, FactoryError> {
        let name = cluster.name().to_string();
        if self.clusters.contains_key(&name) {
            return Err(FactoryError::DuplicateName(name));
        }

        info!(
            "Creating cluster {name} with config {}",
            cluster.config_file().display()
        );
        let output = self.pcluster.create(cluster.config_file(), &name)?;
        if !output.stdout.contains(CREATE_COMPLETE) {
            let err = FactoryError::CreationFailed {
                name,
                output: output.stdout,
            };
            error!("{err}");
            return Err(err);
        }
        info!("Cluster {name} created successfully");

        Ok(self.clusters.entry(name).or_insert(cluster))
    }

    /// Destroys a created cluster, unknown names are skipped.
    ///
    /// Process-level failures of the delete command are retried as configured by
    /// the destroy policy. A `DELETE_FAILED` report is returned right away.
    pub fn destroy(&mut self, name: &str) -> Result<(), FactoryError> {
        info!("Destroying cluster {name}");
        let Some(cluster) = self.clusters.get(name) else {
            warn!("Couldn't find cluster with name {name}. Skipping deletion.");
            return Ok(());
        };

        let pcluster = &self.pcluster;
        let config_file = cluster.config_file();
        self.destroy_policy.run(
            &format!("destroy cluster {name}"),
            FactoryError::is_process_failure,
            || {
                let output = pcluster.delete(config_file, name)?;
                if output.stdout.contains(DELETE_FAILED) {
                    let err = FactoryError::DeletionFailed {
                        name: name.to_string(),
                        output: output.stdout,
                    };
                    error!("{err}");
                    return Err(err);
                }
                Ok(())
            },
        )?;

        self.clusters.remove(name);
        info!("Cluster {name} deleted successfully");
        Ok(())
    }

    /// Destroys every registered cluster, a failure does not stop the others.
    pub fn destroy_all(&mut self) {
        debug!("Destroying all clusters");
        for name in self.names() {
            if let Err(err) = self.destroy(&name) {
                error!("Failed when destroying cluster {name} with exception {err}.");
            }
        }
    }
}

/// Owns a [ClustersFactory] and destroys all its clusters when dropped, even on panic.
pub struct TeardownGuard<R: CommandRunner> {
    factory: ClustersFactory<R>,
}

impl<R: CommandRunner> TeardownGuard<R> {
    pub fn new(factory: ClustersFactory<R>) -> Self {
        Self { factory }
    }
}

impl<R: CommandRunner> Deref for TeardownGuard<R> {
    type Target = ClustersFactory<R>;

    fn deref(&self) -> &Self::Target {
        &self.factory
    }
}

impl<R: CommandRunner> DerefMut for TeardownGuard<R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.factory
    }
}

impl<R: CommandRunner> Drop for TeardownGuard<R> {
    fn drop(&mut self) {
        self.factory.destroy_all();
    }
}
