//! Stand-in browser pool for the demo binary (§6.1).
//!
//! The real collaborator authenticates and recycles headless-browser
//! sessions against the ERP; that is out of scope for this repository. This
//! implementation only tracks which agents currently hold a context so the
//! demo can log acquire/release pairs and simulate `markInUse`/`markIdle`.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use scheduler_core::browser_pool::{BrowserPool, ContextHandle};
use scheduler_core::ids::UserId;
use tracing::{debug, warn};

#[derive(Default)]
pub struct DemoBrowserPool {
    held: Mutex<HashSet<UserId>>,
}

impl DemoBrowserPool {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BrowserPool for DemoBrowserPool {
    async fn acquire_context(
        &self,
        user_id: UserId,
        from_queue: bool,
    ) -> anyhow::Result<ContextHandle> {
        let mut held = self.held.lock().unwrap();
        if !held.insert(user_id) {
            anyhow::bail!("agent {user_id} already holds a browser context");
        }
        debug!(%user_id, from_queue, "acquired demo browser context");
        Ok(ContextHandle(format!("demo-ctx-{user_id}")))
    }

    async fn release_context(&self, user_id: UserId, handle: ContextHandle, success: bool) {
        self.held.lock().unwrap().remove(&user_id);
        if success {
            debug!(%user_id, context = %handle.0, "released demo browser context");
        } else {
            warn!(%user_id, context = %handle.0, "released demo browser context after failure, may be poisoned");
        }
    }
}
