use crate::layout::StoreLayout;
use crate::record::NetworkRef;
use crate::{write_atomic, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;

/// Agent-wide identifiers that outlive any single service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_network: Option<NetworkRef>,
}

impl AgentRecord {
    pub fn load(layout: &StoreLayout) -> Result<Self, StoreError> {
        let path = layout.agent_file();
        if !path.exists() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn save(&self, layout: &StoreLayout) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(self)?;
        write_atomic(&layout.agent_file(), content.as_bytes())
    }
}
