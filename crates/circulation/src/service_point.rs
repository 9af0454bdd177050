use serde::{Deserialize, Serialize};

/// The subset of an inventory service-point snapshot copied onto requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePointSnapshot {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,
}

impl ServicePointSnapshot {
    pub fn name_changed(&self, other: &ServicePointSnapshot) -> bool {
        self.name != other.name
    }
}
