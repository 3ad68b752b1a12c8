//! Destination mapping.

use crate::Destination;

/// Rewrites a logical destination into a transport specific one.
pub trait DestinationMapper: Send + Sync {
    fn map(&self, destination: &Destination) -> Destination;
}

/// Leaves destinations untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityDestinationMapper;

impl DestinationMapper for IdentityDestinationMapper {
    fn map(&self, destination: &Destination) -> Destination {
        destination.clone()
    }
}

/// Scopes targets under the collector's per-instance API path.
#[derive(Debug, Clone)]
pub struct HttpDestinationMapper {
    api_path: String,
}

impl HttpDestinationMapper {
    pub fn new(group_id: &str, agent_id: &str, build_version: &str, instance_id: &str) -> Self {
        Self {
            api_path: format!(
                "/api/groups/{group_id}/agents/{agent_id}/builds/{build_version}/instances/{instance_id}"
            ),
        }
    }

    pub fn api_path(&self) -> &str {
        &self.api_path
    }
}

impl DestinationMapper for HttpDestinationMapper {
    fn map(&self, destination: &Destination) -> Destination {
        let target = if destination.target.is_empty() {
            self.api_path.clone()
        } else {
            format!("{}/{}", self.api_path, destination.target.trim_start_matches('/'))
        };
        Destination::new(destination.kind.clone(), target)
    }
}
