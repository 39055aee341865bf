//! Progress events emitted while an environment is provisioned.

use crate::common::Stage;
use serde::{Deserialize, Serialize};

/// One progress event. `percentage` never exceeds 100.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ProvisionProgress {
    pub percentage: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
}

impl ProvisionProgress {
    pub fn new(environment: Option<String>, percentage: u32, message: String) -> Self {
        Self {
            percentage: percentage.min(100),
            message,
            stage: None,
            environment,
            task_name: None,
        }
    }

    pub fn with_detail(mut self, stage: Option<Stage>, task_name: Option<String>) -> Self {
        self.stage = stage;
        self.task_name = task_name;
        self
    }
}
