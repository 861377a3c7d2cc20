use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(RunStatus {
    Queued => "queued",
    Running => "running",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
});

str_enum!(DocumentRunStatus {
    Pending => "pending",
    InFlight => "in_flight",
    Retrying => "retrying",
    Recorded => "recorded",
    DeadLettered => "dead_lettered",
});

str_enum!(FailureKind {
    GatewayTimeout => "gateway_timeout",
    GatewayUnavailable => "gateway_unavailable",
    NoJsonFound => "no_json_found",
    InvalidJson => "invalid_json",
    SchemaViolation => "schema_violation",
});

impl DocumentRunStatus {
    /// Recorded and dead-lettered documents need no further work in this run.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Recorded | Self::DeadLettered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn run_status_round_trip() {
        for (variant, s) in [
            (RunStatus::Queued, "queued"),
            (RunStatus::Running, "running"),
            (RunStatus::Paused, "paused"),
            (RunStatus::Completed, "completed"),
            (RunStatus::Failed, "failed"),
        ] {
            assert_eq!(variant.as_str(), s);
            assert_eq!(RunStatus::from_str(s).unwrap(), variant);
        }
    }

    #[test]
    fn document_status_round_trip() {
        for (variant, s) in [
            (DocumentRunStatus::Pending, "pending"),
            (DocumentRunStatus::InFlight, "in_flight"),
            (DocumentRunStatus::Retrying, "retrying"),
            (DocumentRunStatus::Recorded, "recorded"),
            (DocumentRunStatus::DeadLettered, "dead_lettered"),
        ] {
            assert_eq!(variant.as_str(), s);
            assert_eq!(DocumentRunStatus::from_str(s).unwrap(), variant);
        }
    }

    #[test]
    fn serde_matches_column_values() {
        let json = serde_json::to_string(&DocumentRunStatus::DeadLettered).unwrap();
        assert_eq!(json, "\"dead_lettered\"");
        let json = serde_json::to_string(&FailureKind::GatewayTimeout).unwrap();
        assert_eq!(json, "\"gateway_timeout\"");
    }

    #[test]
    fn settled_statuses() {
        assert!(DocumentRunStatus::Recorded.is_settled());
        assert!(DocumentRunStatus::DeadLettered.is_settled());
        assert!(!DocumentRunStatus::Retrying.is_settled());
        assert!(!DocumentRunStatus::Pending.is_settled());
    }

    #[test]
    fn invalid_enum_returns_error() {
        assert!(RunStatus::from_str("abandoned").is_err());
        assert!(FailureKind::from_str("").is_err());
    }
}
