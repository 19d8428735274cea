/// Wire protocol for the stepper driver board
///
/// Every message is a single ASCII line terminated by '\n'. The panel sends
/// commands such as `MICROSTEP:16` and the board reports speed as
/// `CURRENT:<rpm>`. Nothing else crosses the link.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Line terminator appended to every outbound command.
pub const LINE_END: &str = "\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unsupported microstep value {0} (expected 1, 2, 4, 8, 16, 32 or 64)")]
    InvalidMicrostep(u32),
    #[error("unsupported profile {0} (expected 1, 2 or 3)")]
    InvalidProfile(u8),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("bad argument '{arg}' for {command}")]
    BadArgument { command: &'static str, arg: String },
}

/// Driver microstep resolution. Only the values the board accepts exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Microstep {
    Full,
    Half,
    Quarter,
    Eighth,
    Sixteenth,
    ThirtySecond,
    SixtyFourth,
}

impl Microstep {
    pub const ALL: [Microstep; 7] = [
        Microstep::Full,
        Microstep::Half,
        Microstep::Quarter,
        Microstep::Eighth,
        Microstep::Sixteenth,
        Microstep::ThirtySecond,
        Microstep::SixtyFourth,
    ];

    pub fn value(self) -> u32 {
        match self {
            Microstep::Full => 1,
            Microstep::Half => 2,
            Microstep::Quarter => 4,
            Microstep::Eighth => 8,
            Microstep::Sixteenth => 16,
            Microstep::ThirtySecond => 32,
            Microstep::SixtyFourth => 64,
        }
    }
}

impl Default for Microstep {
    fn default() -> Self {
        Microstep::Sixteenth
    }
}

impl TryFrom<u32> for Microstep {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Microstep::ALL
            .into_iter()
            .find(|m| m.value() == value)
            .ok_or(ProtocolError::InvalidMicrostep(value))
    }
}

impl fmt::Display for Microstep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Acceleration curve selected on the board by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    Soft,
    Medium,
    Aggressive,
}

impl Profile {
    pub const ALL: [Profile; 3] = [Profile::Soft, Profile::Medium, Profile::Aggressive];

    /// Index sent in `SET_PROFILE:<n>` (1-based).
    pub fn index(self) -> u8 {
        match self {
            Profile::Soft => 1,
            Profile::Medium => 2,
            Profile::Aggressive => 3,
        }
    }

    /// Ramp rate the firmware applies for this profile, in RPM/s.
    pub fn ramp_rpm_per_s(self) -> u32 {
        match self {
            Profile::Soft => 50,
            Profile::Medium => 150,
            Profile::Aggressive => 400,
        }
    }

    pub fn label(self) -> String {
        let name = match self {
            Profile::Soft => "Soft",
            Profile::Medium => "Medium",
            Profile::Aggressive => "Aggressive",
        };
        format!("{} - {} ({} RPM/s)", self.index(), name, self.ramp_rpm_per_s())
    }
}

impl Default for Profile {
    fn default() -> Self {
        Profile::Medium
    }
}

impl TryFrom<u8> for Profile {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Profile::ALL
            .into_iter()
            .find(|p| p.index() == value)
            .ok_or(ProtocolError::InvalidProfile(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Cw,
    Ccw,
}

impl Direction {
    fn wire(self) -> &'static str {
        match self {
            Direction::Cw => "CW",
            Direction::Ccw => "CCW",
        }
    }
}

/// Outbound command. `Display` renders the exact wire text without the
/// line terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
    Start,
    Dir(Direction),
    Microstep(Microstep),
    SetProfile(Profile),
    SetSpeed(u32),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Stop => write!(f, "STOP"),
            Command::Start => write!(f, "START"),
            Command::Dir(dir) => write!(f, "DIR:{}", dir.wire()),
            Command::Microstep(m) => write!(f, "MICROSTEP:{}", m.value()),
            Command::SetProfile(p) => write!(f, "SET_PROFILE:{}", p.index()),
            Command::SetSpeed(rpm) => write!(f, "SET_SPEED:{}", rpm),
        }
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        let (name, arg) = match line.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (line, None),
        };
        let bad = |command: &'static str, arg: &str| ProtocolError::BadArgument {
            command,
            arg: arg.to_string(),
        };

        match (name, arg) {
            ("STOP", None) => Ok(Command::Stop),
            ("START", None) => Ok(Command::Start),
            ("DIR", Some("CW")) => Ok(Command::Dir(Direction::Cw)),
            ("DIR", Some("CCW")) => Ok(Command::Dir(Direction::Ccw)),
            ("DIR", Some(other)) => Err(bad("DIR", other)),
            ("MICROSTEP", Some(arg)) => {
                let value = arg.parse::<u32>().map_err(|_| bad("MICROSTEP", arg))?;
                Ok(Command::Microstep(Microstep::try_from(value)?))
            }
            ("SET_PROFILE", Some(arg)) => {
                let value = arg.parse::<u8>().map_err(|_| bad("SET_PROFILE", arg))?;
                Ok(Command::SetProfile(Profile::try_from(value)?))
            }
            ("SET_SPEED", Some(arg)) => arg
                .parse::<u32>()
                .map(Command::SetSpeed)
                .map_err(|_| bad("SET_SPEED", arg)),
            _ => Err(ProtocolError::UnknownCommand(line.to_string())),
        }
    }
}

/// Prefix of the only inbound line the panel understands.
pub const CURRENT_PREFIX: &str = "CURRENT:";

/// Parse a `CURRENT:<rpm>` telemetry line. Only the field up to the next ':'
/// is read. Any other line, or a field that is not a float, gives `None`.
pub fn parse_current(line: &str) -> Option<f64> {
    let payload = line.strip_prefix(CURRENT_PREFIX)?;
    payload.split(':').next()?.trim().parse::<f64>().ok()
}
