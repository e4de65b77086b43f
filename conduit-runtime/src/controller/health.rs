// Component health
// Health records reported by evaluation, the lifecycle runner and components themselves

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthType {
    Unknown,
    Healthy,
    Unhealthy,
    /// The component's run task returned; terminal
    Exited,
}

impl HealthType {
    /// Severity used when merging health records; higher is worse
    fn severity(self) -> u8 {
        match self {
            HealthType::Healthy => 0,
            HealthType::Unknown => 1,
            HealthType::Unhealthy => 2,
            HealthType::Exited => 3,
        }
    }
}

impl fmt::Display for HealthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthType::Unknown => "unknown",
            HealthType::Healthy => "healthy",
            HealthType::Unhealthy => "unhealthy",
            HealthType::Exited => "exited",
        };
        write!(f, "{}", name)
    }
}

/// A health status with the message and time it was recorded
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub health: HealthType,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

impl Health {
    pub fn new(health: HealthType, message: impl Into<String>) -> Self {
        Self {
            health,
            message: message.into(),
            updated_at: Utc::now(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(HealthType::Unknown, "")
    }

    pub fn healthy(message: impl Into<String>) -> Self {
        Self::new(HealthType::Healthy, message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(HealthType::Unhealthy, message)
    }

    pub fn exited(message: impl Into<String>) -> Self {
        Self::new(HealthType::Exited, message)
    }

    /// The worst of several records; on equal severity the most recent wins
    pub fn least_healthy<'a>(records: impl IntoIterator<Item = &'a Health>) -> Health {
        records
            .into_iter()
            .max_by(|a, b| {
                a.health
                    .severity()
                    .cmp(&b.health.severity())
                    .then(a.updated_at.cmp(&b.updated_at))
            })
            .cloned()
            .unwrap_or_else(Health::unknown)
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.health)
        } else {
            write!(f, "{}: {}", self.health, self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_least_healthy_prefers_severity() {
        let healthy = Health::healthy("ok");
        let unhealthy = Health::unhealthy("collect failed");
        let unknown = Health::unknown();

        let merged = Health::least_healthy([&healthy, &unhealthy, &unknown]);
        assert_eq!(merged.health, HealthType::Unhealthy);
        assert_eq!(merged.message, "collect failed");

        let merged = Health::least_healthy([&healthy, &unknown]);
        assert_eq!(merged.health, HealthType::Unknown);
    }

    #[test]
    fn test_least_healthy_tie_takes_newest() {
        let mut older = Health::unhealthy("old");
        older.updated_at = older.updated_at - Duration::seconds(10);
        let newer = Health::unhealthy("new");

        assert_eq!(Health::least_healthy([&newer, &older]).message, "new");
        assert_eq!(Health::least_healthy([&older, &newer]).message, "new");
    }

    #[test]
    fn test_least_healthy_empty_is_unknown() {
        assert_eq!(
            Health::least_healthy(std::iter::empty()).health,
            HealthType::Unknown
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Health::exited("done").to_string(), "exited: done");
        assert_eq!(Health::unknown().to_string(), "unknown");
    }
}
