//! Correlation identifiers linking a request to its reply.

use std::fmt;
use uuid::Uuid;

/// Opaque token linking one outbound request to its inbound reply.
///
/// Ids minted locally are random 16-byte UUIDs. Ids read from the wire are
/// kept verbatim, whatever their length, so foreign producers can use their
/// own scheme.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(Vec<u8>);

impl CorrelationId {
    /// Mint a fresh random id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().as_bytes().to_vec())
    }

    /// Wrap raw header bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Raw bytes as written to the `correlationId` header.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 16-byte ids print as UUIDs, anything else as plain hex
        if let Ok(uuid) = Uuid::from_slice(&self.0) {
            return write!(f, "{uuid}");
        }
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn random_ids_are_distinct() {
        let ids: HashSet<_> = (0..1000).map(|_| CorrelationId::random()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn foreign_ids_display_as_hex() {
        let id = CorrelationId::from_bytes(&[0xde, 0xad, 0x01]);
        assert_eq!(id.to_string(), "dead01");
        assert_eq!(format!("{id:?}"), "CorrelationId(dead01)");
    }

    #[test]
    fn uuid_ids_display_as_uuid() {
        let uuid = Uuid::new_v4();
        let id = CorrelationId::from_bytes(uuid.as_bytes());
        assert_eq!(id.to_string(), uuid.to_string());
        assert_eq!(id.as_bytes().len(), 16);
    }
}
