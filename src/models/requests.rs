//! Request DTOs for the demo HTTP service
//!
//! Defines the structure of incoming query strings.

use serde::Deserialize;

/// Maximum number of ids accepted by one `GET /users` request
pub const MAX_IDS_PER_REQUEST: usize = 100;

/// Query string of `GET /users?ids=1,2,3`
#[derive(Debug, Clone, Deserialize)]
pub struct UsersQuery {
    /// Comma-separated user ids
    #[serde(default)]
    pub ids: String,
}

impl UsersQuery {
    /// Parses the id list, keeping input order and duplicates.
    ///
    /// Returns an error message if the list is empty, too long or contains
    /// something that is not an id.
    pub fn parse_ids(&self) -> Result<Vec<u64>, String> {
        let ids = self
            .ids
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u64>()
                    .map_err(|_| format!("'{}' is not a valid id", part))
            })
            .collect::<Result<Vec<u64>, String>>()?;

        if ids.is_empty() {
            return Err("ids cannot be empty".to_string());
        }
        if ids.len() > MAX_IDS_PER_REQUEST {
            return Err(format!(
                "at most {} ids per request, got {}",
                MAX_IDS_PER_REQUEST,
                ids.len()
            ));
        }
        Ok(ids)
    }
}
