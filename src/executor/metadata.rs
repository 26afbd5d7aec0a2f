//! Deployment metadata store
//!
//! Opaque key/value pairs recorded during execution (e.g. the approver of
//! a WaitApproval stage), mirrored to the control plane on every write so
//! they survive agent restarts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::apiclient::PipedService;
use crate::errors::PipedError;

pub struct MetadataStore {
    api: Arc<dyn PipedService>,
    deployment_id: String,
    shared: Mutex<HashMap<String, String>>,
    stages: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MetadataStore {
    pub fn new(api: Arc<dyn PipedService>, deployment_id: &str) -> Self {
        Self {
            api,
            deployment_id: deployment_id.to_string(),
            shared: Mutex::new(HashMap::new()),
            stages: Mutex::new(HashMap::new()),
        }
    }

    /// Seed from a deployment fetched after a restart.
    pub fn seed(&self, shared: HashMap<String, String>) {
        let mut map = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        *map = shared;
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let map = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        map.get(key).cloned()
    }

    pub fn get_stage(&self, stage_id: &str, key: &str) -> Option<String> {
        let stages = self.stages.lock().unwrap_or_else(|e| e.into_inner());
        stages.get(stage_id)?.get(key).cloned()
    }

    /// Set a deployment-level value and persist the whole map.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), PipedError> {
        let snapshot = {
            let mut map = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            map.insert(key.to_string(), value.to_string());
            map.clone()
        };
        self.api
            .save_deployment_metadata(&self.deployment_id, snapshot)
            .await
    }

    /// Set a stage-level value and persist that stage's map.
    pub async fn set_stage(
        &self,
        stage_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), PipedError> {
        let snapshot = {
            let mut stages = self.stages.lock().unwrap_or_else(|e| e.into_inner());
            let map = stages.entry(stage_id.to_string()).or_default();
            map.insert(key.to_string(), value.to_string());
            map.clone()
        };
        self.api
            .save_stage_metadata(&self.deployment_id, stage_id, snapshot)
            .await
    }
}
