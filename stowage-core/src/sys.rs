use std::{collections::BTreeMap, path::PathBuf};

use stowage_common::Capability;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct DriverInfo {
    pub name: String,
    pub capabilities: Vec<Capability>,
    pub info: BTreeMap<String, String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct SystemInfo {
    pub stowage_version: String,
    #[schema(value_type = String)]
    pub root: PathBuf,
    pub default_driver: Option<String>,
    pub drivers: Vec<DriverInfo>,
    pub volumes: usize,
    pub snapshots: usize,
}
