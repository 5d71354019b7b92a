use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Two-letter program code every student id starts with.
pub const PROGRAM_CODE: &str = "FQ";
const DIGITS: usize = 6;

/// `FQ` followed by six decimal digits.
///
/// Ids come from the low digits of a millisecond clock, so two ids minted
/// within the same millisecond (or exactly 10^6 ms apart) collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StudentIdentifier(String);

impl StudentIdentifier {
    pub fn generate() -> Self {
        Self::from_millis(Utc::now().timestamp_millis())
    }

    pub fn from_millis(millis: i64) -> Self {
        let low = millis.unsigned_abs() % 10u64.pow(DIGITS as u32);
        StudentIdentifier(format!("{}{:0width$}", PROGRAM_CODE, low, width = DIGITS))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{0}` is not a valid student id")]
pub struct InvalidIdentifier(pub String);

impl FromStr for StudentIdentifier {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix(PROGRAM_CODE);
        match digits {
            Some(d) if d.len() == DIGITS && d.bytes().all(|b| b.is_ascii_digit()) => {
                Ok(StudentIdentifier(s.to_string()))
            }
            _ => Err(InvalidIdentifier(s.to_string())),
        }
    }
}

impl TryFrom<String> for StudentIdentifier {
    type Error = InvalidIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StudentIdentifier> for String {
    fn from(id: StudentIdentifier) -> Self {
        id.0
    }
}
