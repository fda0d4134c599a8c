// src/models/user.rs
use serde::{Deserialize, Serialize};

use super::ride::Coordinate;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Passenger, // Someone requesting rides
    Driver,    // Someone driving them
    Admin,     // Dashboard operator
}

/// Profile owned by the auth/profile collaborator. The dispatch core only
/// reads it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "userType")]
    pub role: UserRole,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub profile_completed: bool,
    #[serde(default)]
    pub location: Option<Coordinate>,
}

impl User {
    /// Drivers take requests only once onboarding is done and they are online.
    pub fn dispatchable_reason(&self) -> Option<&'static str> {
        if self.role != UserRole::Driver {
            Some("user is not a driver")
        } else if !self.profile_completed {
            Some("driver has not completed their profile")
        } else if !self.is_online {
            Some("driver is offline")
        } else {
            None
        }
    }

    pub fn is_dispatchable(&self) -> bool {
        self.dispatchable_reason().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> User {
        User {
            id: "driver-1".into(),
            role: UserRole::Driver,
            display_name: Some("Mehmet".into()),
            is_online: true,
            profile_completed: true,
            location: Some(Coordinate::new(37.86, 32.47)),
        }
    }

    #[test]
    fn test_dispatchable_driver() {
        assert!(driver().is_dispatchable());
    }

    #[test]
    fn test_incomplete_or_offline_driver_is_not_dispatchable() {
        let mut incomplete = driver();
        incomplete.profile_completed = false;
        assert_eq!(
            incomplete.dispatchable_reason(),
            Some("driver has not completed their profile")
        );

        let mut offline = driver();
        offline.is_online = false;
        assert_eq!(offline.dispatchable_reason(), Some("driver is offline"));

        let mut passenger = driver();
        passenger.role = UserRole::Passenger;
        assert!(!passenger.is_dispatchable());
    }

    #[test]
    fn test_legacy_user_type_field() {
        let user: User = serde_json::from_str(
            r#"{"id":"u1","userType":"driver","isOnline":true,"profileCompleted":true}"#,
        )
        .unwrap();
        assert_eq!(user.role, UserRole::Driver);
        assert!(user.is_dispatchable());
    }
}
