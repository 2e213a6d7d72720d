use std::fmt;

/// Protocol versions the broker speaks, ordered oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V1_0,
    V1_1,
    V1_2,
}

impl ProtocolVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V1_0 => "1.0",
            ProtocolVersion::V1_1 => "1.1",
            ProtocolVersion::V1_2 => "1.2",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "1.0" => Some(ProtocolVersion::V1_0),
            "1.1" => Some(ProtocolVersion::V1_1),
            "1.2" => Some(ProtocolVersion::V1_2),
            _ => None,
        }
    }

    /// Picks the highest version listed in an `accept-version` header.
    /// A missing header means a 1.0 client.
    pub fn negotiate(accept_version: Option<&str>) -> Option<Self> {
        match accept_version {
            None => Some(ProtocolVersion::V1_0),
            Some(raw) => raw.split(',').filter_map(Self::parse).max(),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_highest_common_version() {
        assert_eq!(
            ProtocolVersion::negotiate(Some("1.0,1.1,1.2")),
            Some(ProtocolVersion::V1_2)
        );
        assert_eq!(
            ProtocolVersion::negotiate(Some("1.1, 2.0")),
            Some(ProtocolVersion::V1_1)
        );
        assert_eq!(ProtocolVersion::negotiate(None), Some(ProtocolVersion::V1_0));
        assert_eq!(ProtocolVersion::negotiate(Some("2.0")), None);
    }
}
