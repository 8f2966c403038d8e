use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A resource ceiling expressed as `HH:MM:SS`, stored internally as a duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Walltime(Duration);

impl Walltime {
    pub fn from_secs(secs: u64) -> Self {
        Walltime(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }
}

impl fmt::Display for Walltime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.0.as_secs();
        let (h, rem) = (total / 3600, total % 3600);
        let (m, s) = (rem / 60, rem % 60);
        write!(f, "{:02}:{:02}:{:02}", h, m, s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid walltime {0:?}: expected HH:MM:SS, MM:SS, or a bare second count")]
pub struct WalltimeParseError(String);

impl FromStr for Walltime {
    type Err = WalltimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let secs = match parts.as_slice() {
            [secs] => secs.parse::<u64>().map_err(|_| WalltimeParseError(s.to_string()))?,
            [mins, secs] => {
                let mins: u64 = mins.parse().map_err(|_| WalltimeParseError(s.to_string()))?;
                let secs: u64 = secs.parse().map_err(|_| WalltimeParseError(s.to_string()))?;
                mins * 60 + secs
            }
            [hours, mins, secs] => {
                let hours: u64 = hours.parse().map_err(|_| WalltimeParseError(s.to_string()))?;
                let mins: u64 = mins.parse().map_err(|_| WalltimeParseError(s.to_string()))?;
                let secs: u64 = secs.parse().map_err(|_| WalltimeParseError(s.to_string()))?;
                hours * 3600 + mins * 60 + secs
            }
            _ => return Err(WalltimeParseError(s.to_string())),
        };
        Ok(Walltime(Duration::from_secs(secs)))
    }
}

impl TryFrom<String> for Walltime {
    type Error = WalltimeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Walltime> for String {
    fn from(value: Walltime) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hh_mm_ss() {
        let w: Walltime = "01:02:03".parse().unwrap();
        assert_eq!(w.as_secs(), 3723);
        assert_eq!(w.to_string(), "01:02:03");
    }

    #[test]
    fn parses_bare_seconds() {
        let w: Walltime = "90".parse().unwrap();
        assert_eq!(w.as_secs(), 90);
        assert_eq!(w.to_string(), "00:01:30");
    }

    #[test]
    fn rejects_garbage() {
        assert!("not-a-time".parse::<Walltime>().is_err());
    }
}
