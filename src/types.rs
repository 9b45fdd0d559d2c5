//! Basic type definitions for the chat server
//!
//! Provides a newtype wrapper for type safety:
//! - `ClientId`: sequential unique client identifier

/// Unique client identifier (newtype pattern)
///
/// Wraps the server's monotonically incrementing counter value.
/// Implements Hash and Eq for use as map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Display name assigned to this client at accept time
    pub fn display_name(&self) -> String {
        format!("client-{}", self.0)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_display_name() {
        let id = ClientId(3);
        assert_eq!(id.display_name(), "client-3");
        assert_eq!(id.to_string(), "3");
    }
}
