//! Shared application state handed to every request handler.

use std::sync::Arc;

use vmgate_common::GatewayConfig;

use crate::audit::AuditSink;
use crate::directory::VmDirectory;
use crate::executor::OperationExecutor;
use crate::gcloud::CloudCli;
use crate::names::NameResolver;
use crate::policy::AuthorizationPolicy;

pub struct AppState {
    pub directory: Arc<VmDirectory>,
    pub executor: Arc<OperationExecutor>,
    pub audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Wire every component from one validated configuration.
    #[must_use]
    pub fn new(
        config: &GatewayConfig,
        cli: Arc<dyn CloudCli>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let directory = Arc::new(VmDirectory::from_config(config, Arc::clone(&cli)));
        let executor = Arc::new(OperationExecutor::new(
            NameResolver::from_config(config),
            AuthorizationPolicy::from_config(config),
            Arc::clone(&directory),
            cli,
            Arc::clone(&audit),
        ));
        Self {
            directory,
            executor,
            audit,
        }
    }
}
