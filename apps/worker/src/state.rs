use std::sync::Arc;

use crate::config::WorkerConfig;
use crate::features::router::SandboxRouter;
use crate::features::vms::manager::VmManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<WorkerConfig>,
    pub manager: Arc<VmManager>,
    pub router: Arc<SandboxRouter>,
}
