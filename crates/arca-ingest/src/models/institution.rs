//! Depositor institutions as the registry describes them

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Institution {
    #[serde(default)]
    pub id: i64,

    /// Domain identifier, e.g. "inst.edu". Bags and object identifiers are
    /// namespaced under this.
    pub identifier: String,

    pub name: String,

    #[serde(default)]
    pub receiving_bucket: String,

    #[serde(default)]
    pub restore_bucket: String,
}
