// TAI timestamps
// The seconds:nanoseconds pairs used both as wall-clock time and as the store's logical clock

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Current offset between TAI and UTC, in seconds.
///
/// There has been no leap second since 2017, so a constant is sufficient until
/// the next one is announced.
pub const TAI_UTC_OFFSET_SECONDS: u64 = 37;

/// A TAI timestamp with nanosecond resolution.
///
/// Besides representing wall-clock instants, `Tai` values are used as the
/// resource store's totally ordered logical clock: every mutation is stamped
/// with a value strictly greater than any previously issued, so observers can
/// use `updated` timestamps as cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tai {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl Tai {
    pub const MIN: Tai = Tai {
        seconds: 0,
        nanoseconds: 0,
    };

    pub const MAX: Tai = Tai {
        seconds: u64::MAX,
        nanoseconds: 999_999_999,
    };

    pub fn new(seconds: u64, nanoseconds: u32) -> Self {
        Tai {
            seconds,
            nanoseconds,
        }
    }

    /// The current TAI time, derived from the system clock.
    pub fn now() -> Self {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Tai {
            seconds: unix.as_secs() + TAI_UTC_OFFSET_SECONDS,
            nanoseconds: unix.subsec_nanos(),
        }
    }

    /// The smallest representable timestamp greater than this one.
    pub fn successor(self) -> Self {
        if self.nanoseconds < 999_999_999 {
            Tai {
                seconds: self.seconds,
                nanoseconds: self.nanoseconds + 1,
            }
        } else {
            Tai {
                seconds: self.seconds + 1,
                nanoseconds: 0,
            }
        }
    }

    /// This timestamp plus a whole number of seconds.
    pub fn plus_seconds(self, seconds: u64) -> Self {
        Tai {
            seconds: self.seconds + seconds,
            nanoseconds: self.nanoseconds,
        }
    }

    /// This timestamp plus a number of milliseconds.
    pub fn plus_millis(self, millis: u64) -> Self {
        let mut seconds = self.seconds + millis / 1000;
        let mut nanoseconds = self.nanoseconds + (millis % 1000) as u32 * 1_000_000;
        if nanoseconds >= 1_000_000_000 {
            seconds += 1;
            nanoseconds -= 1_000_000_000;
        }
        Tai {
            seconds,
            nanoseconds,
        }
    }

    /// The duration from `earlier` to this timestamp, zero if not later.
    pub fn duration_since(self, earlier: Tai) -> std::time::Duration {
        if self <= earlier {
            return std::time::Duration::ZERO;
        }
        let mut seconds = self.seconds - earlier.seconds;
        let nanoseconds = if self.nanoseconds >= earlier.nanoseconds {
            self.nanoseconds - earlier.nanoseconds
        } else {
            seconds -= 1;
            1_000_000_000 + self.nanoseconds - earlier.nanoseconds
        };
        std::time::Duration::new(seconds, nanoseconds)
    }

    /// Interpret this value as a duration and add it to `base`.
    ///
    /// Used to resolve `activate_scheduled_relative` requests against the
    /// time the request was received.
    pub fn after(self, base: Tai) -> Self {
        let mut seconds = base.seconds + self.seconds;
        let mut nanoseconds = base.nanoseconds + self.nanoseconds;
        if nanoseconds >= 1_000_000_000 {
            seconds += 1;
            nanoseconds -= 1_000_000_000;
        }
        Tai {
            seconds,
            nanoseconds,
        }
    }
}

impl fmt::Display for Tai {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seconds, self.nanoseconds)
    }
}

impl FromStr for Tai {
    type Err = ParseTaiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (seconds, nanoseconds) = s.split_once(':').ok_or(ParseTaiError)?;
        Ok(Tai {
            seconds: seconds.parse().map_err(|_| ParseTaiError)?,
            nanoseconds: nanoseconds.parse().map_err(|_| ParseTaiError)?,
        })
    }
}

/// Error returned when a string is not a valid `<seconds>:<nanoseconds>` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseTaiError;

impl fmt::Display for ParseTaiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid TAI timestamp")
    }
}

impl std::error::Error for ParseTaiError {}

// On the wire TAI timestamps are strings, e.g. "1441704616:890020960"
impl Serialize for Tai {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Tai {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
