use serde::Deserialize;

/// Query string accepted by every stream route.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StreamParams {
    /// Comma-separated peer ids.
    #[serde(default)]
    pub peers: Option<String>,
    /// Comma-separated group ids.
    #[serde(default)]
    pub groups: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
}

fn split_ids(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

impl StreamParams {
    pub fn peer_ids(&self) -> Vec<String> {
        split_ids(self.peers.as_deref())
    }

    pub fn group_ids(&self) -> Vec<String> {
        split_ids(self.groups.as_deref())
    }

    pub fn device(&self) -> String {
        self.device
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or("unknown")
            .to_string()
    }
}
