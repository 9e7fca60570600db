//! Component health model.
//!
//! Every controller node keeps two healths (evaluation and run) and reports
//! the least healthy of those plus whatever the component itself reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health status of a node or component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No health information yet.
    Unknown,
    /// Operating normally.
    Healthy,
    /// Operating, but degraded or failing.
    Unhealthy,
    /// The component's run has returned.
    Exited,
}

impl HealthStatus {
    /// Severity rank; higher is worse.
    const fn rank(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Unknown => 1,
            Self::Unhealthy => 2,
            Self::Exited => 3,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// A health status with its explanatory message and update time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    /// Current status.
    pub status: HealthStatus,
    /// Human-readable explanation of the status.
    pub message: String,
    /// When the status last changed.
    pub updated: DateTime<Utc>,
}

impl Health {
    /// Create a health value stamped with the current time.
    #[must_use]
    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), updated: Utc::now() }
    }

    /// Shorthand for [`HealthStatus::Unknown`].
    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unknown, message)
    }

    /// Shorthand for [`HealthStatus::Healthy`].
    #[must_use]
    pub fn healthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Healthy, message)
    }

    /// Shorthand for [`HealthStatus::Unhealthy`].
    #[must_use]
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy, message)
    }

    /// Shorthand for [`HealthStatus::Exited`].
    #[must_use]
    pub fn exited(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Exited, message)
    }

    /// Combine healths, returning the least healthy one.
    ///
    /// Ordering from best to worst: Healthy, Unknown, Unhealthy, Exited.
    /// Ties keep the earliest argument.
    ///
    /// # Panics
    ///
    /// Panics if `healths` is empty.
    #[must_use]
    pub fn least_healthy<'a>(healths: impl IntoIterator<Item = &'a Health>) -> Health {
        healths
            .into_iter()
            .reduce(|worst, h| {
                if h.status.rank() > worst.status.rank() {
                    h
                } else {
                    worst
                }
            })
            .expect("least_healthy called with no healths")
            .clone()
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::unknown("created")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_healthy_ordering() {
        let healthy = Health::healthy("ok");
        let unknown = Health::unknown("new");
        let unhealthy = Health::unhealthy("bad");
        let exited = Health::exited("done");

        let worst = Health::least_healthy([&healthy, &unknown, &unhealthy, &exited]);
        assert_eq!(worst.status, HealthStatus::Exited);

        let worst = Health::least_healthy([&healthy, &unknown]);
        assert_eq!(worst.status, HealthStatus::Unknown);

        let worst = Health::least_healthy([&healthy, &healthy]);
        assert_eq!(worst.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_least_healthy_keeps_message() {
        let a = Health::healthy("running");
        let b = Health::unhealthy("evaluation failed: boom");
        let worst = Health::least_healthy([&a, &b]);
        assert_eq!(worst.message, "evaluation failed: boom");
    }
}
