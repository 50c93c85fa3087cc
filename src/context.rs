//! Per-run handle.
//!
//! A [`RunContext`] is built once at the start of a command and passed by
//! reference to every component. It owns the cluster and process
//! capabilities for the run; nothing in the crate reaches for a global client.

use std::sync::Arc;

use kube::Client;

use crate::cluster::{ClusterClient, KubeClusterClient};
use crate::descriptor::ClusterDescriptor;
use crate::process::{CommandRunner, TokioCommandRunner};

/// Everything a single run needs to talk to the outside world.
pub struct RunContext {
    /// The cluster being operated on
    pub descriptor: ClusterDescriptor,
    /// Kubernetes access (trait object for testability)
    pub cluster: Arc<dyn ClusterClient>,
    /// External process execution
    pub commands: Arc<dyn CommandRunner>,
    /// Label selector used when listing pods for diagnostics (empty for all)
    pub pod_selector: String,
}

impl RunContext {
    /// Create a builder for constructing a RunContext
    pub fn builder(client: Client, descriptor: ClusterDescriptor) -> RunContextBuilder {
        RunContextBuilder::new(client, descriptor)
    }

    /// Create a context with real clients
    pub fn new(client: Client, descriptor: ClusterDescriptor) -> Self {
        Self::builder(client, descriptor).build()
    }

    /// Create a context for testing with custom clients
    #[cfg(test)]
    pub fn for_testing(
        descriptor: ClusterDescriptor,
        cluster: Arc<dyn ClusterClient>,
        commands: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            descriptor,
            cluster,
            commands,
            pod_selector: String::new(),
        }
    }

    /// Namespace of the cluster
    pub fn namespace(&self) -> &str {
        &self.descriptor.namespace
    }
}

/// Builder for [`RunContext`]
pub struct RunContextBuilder {
    client: Client,
    descriptor: ClusterDescriptor,
    cluster: Option<Arc<dyn ClusterClient>>,
    commands: Option<Arc<dyn CommandRunner>>,
    pod_selector: String,
}

impl RunContextBuilder {
    fn new(client: Client, descriptor: ClusterDescriptor) -> Self {
        Self {
            client,
            descriptor,
            cluster: None,
            commands: None,
            pod_selector: String::new(),
        }
    }

    /// Override the cluster client (primarily for testing)
    pub fn cluster_client(mut self, cluster: Arc<dyn ClusterClient>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Override the command runner (primarily for testing)
    pub fn command_runner(mut self, commands: Arc<dyn CommandRunner>) -> Self {
        self.commands = Some(commands);
        self
    }

    /// Restrict diagnostic pod listings to a label selector
    pub fn pod_selector(mut self, selector: impl Into<String>) -> Self {
        self.pod_selector = selector.into();
        self
    }

    /// Build the context
    pub fn build(self) -> RunContext {
        let client = self.client;
        RunContext {
            descriptor: self.descriptor,
            cluster: self
                .cluster
                .unwrap_or_else(|| Arc::new(KubeClusterClient::new(client))),
            commands: self
                .commands
                .unwrap_or_else(|| Arc::new(TokioCommandRunner)),
            pod_selector: self.pod_selector,
        }
    }
}
