// src/utils/id_generator.rs
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdType {
    Ride,
}

impl IdType {
    pub fn to_prefix(&self) -> &'static str {
        match self {
            IdType::Ride => "rid",
        }
    }
}

pub struct IdGenerator;

impl IdGenerator {
    /// Generate an id of the form `{prefix}-{YYMMDD}-{suffix}` where the
    /// suffix is 5 characters mixing hex and alphanumeric.
    pub fn generate(id_type: IdType) -> String {
        Self::generate_with_timestamp(id_type, Utc::now())
    }

    pub fn generate_with_timestamp(id_type: IdType, timestamp: DateTime<Utc>) -> String {
        let date_part = timestamp.format("%y%m%d").to_string();
        let random_suffix = Self::generate_random_suffix();

        format!("{}-{}-{}", id_type.to_prefix(), date_part, random_suffix)
    }

    fn generate_random_suffix() -> String {
        // Either 3 hex + 2 alphanumeric or 3 alphanumeric + 2 hex
        if rand::random::<bool>() {
            format!(
                "{}{}",
                Self::generate_from_chars(HEX_CHARS, 3),
                Self::generate_from_chars(ALPHANUMERIC_CHARS, 2)
            )
        } else {
            format!(
                "{}{}",
                Self::generate_from_chars(ALPHANUMERIC_CHARS, 3),
                Self::generate_from_chars(HEX_CHARS, 2)
            )
        }
    }

    fn generate_from_chars(charset: &[u8], n: usize) -> String {
        use rand::Rng;

        let mut rng = rand::rng();
        (0..n)
            .map(|_| charset[rng.random_range(0..charset.len())] as char)
            .collect()
    }
}

const HEX_CHARS: &[u8] = b"0123456789abcdef";
const ALPHANUMERIC_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

pub fn generate_ride_id() -> String {
    IdGenerator::generate(IdType::Ride)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ride_id_generation() {
        let ride_id = generate_ride_id();
        let parts: Vec<&str> = ride_id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "rid");
        assert!(parts[1].len() == 6 && parts[1].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_id_carries_the_creation_date() {
        let test_date = Utc.with_ymd_and_hms(2025, 10, 15, 0, 0, 0).unwrap();
        let id = IdGenerator::generate_with_timestamp(IdType::Ride, test_date);
        assert!(id.starts_with("rid-251015-"));
        assert_eq!(id.len(), "rid-251015-".len() + 5);
    }

    #[test]
    fn test_random_suffix_pattern() {
        for _ in 0..100 {
            let suffix = IdGenerator::generate_random_suffix();
            assert_eq!(suffix.len(), 5);
            assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()), "bad suffix {}", suffix);
        }
    }
}
