/// Operator actions, independent of the input device
///
/// Buttons, the speed slider, keyboard shortcuts and console words all map
/// onto one `Intent`, which the controller applies.

use std::str::FromStr;
use thiserror::Error;

use crate::protocol::{Direction, Microstep, Profile, ProtocolError};

/// RPM change per up/down key press.
pub const SPEED_NUDGE_RPM: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    ToggleConnection,
    /// Connect to the named port, or the configured one when `None`.
    Connect(Option<String>),
    Disconnect,
    SelectMicrostep(Microstep),
    SelectProfile(Profile),
    Start,
    Stop,
    ToggleRun,
    Direction(Direction),
    SetSpeed(u32),
    NudgeSpeed(i32),
}

/// Keyboard shortcuts of the control panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Space,
    Up,
    Down,
    Left,
    Right,
}

impl Key {
    pub fn intent(self) -> Intent {
        match self {
            Key::Space => Intent::ToggleRun,
            Key::Up => Intent::NudgeSpeed(SPEED_NUDGE_RPM),
            Key::Down => Intent::NudgeSpeed(-SPEED_NUDGE_RPM),
            Key::Left => Intent::Direction(Direction::Cw),
            Key::Right => Intent::Direction(Direction::Ccw),
        }
    }

    fn from_token(token: &str) -> Option<Key> {
        match token {
            "space" => Some(Key::Space),
            "+" | "up" => Some(Key::Up),
            "-" | "down" => Some(Key::Down),
            "<" | "left" => Some(Key::Left),
            ">" | "right" => Some(Key::Right),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntentError {
    #[error("empty input")]
    Empty,
    #[error("unknown action '{0}'")]
    Unknown(String),
    #[error("'{0}' needs a value")]
    MissingValue(&'static str),
    #[error("'{verb}' got unexpected extra input '{extra}'")]
    Trailing { verb: String, extra: String },
    #[error("invalid number '{0}'")]
    BadNumber(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

fn number<T: FromStr>(verb: &'static str, arg: Option<&str>) -> Result<T, IntentError> {
    let arg = arg.ok_or(IntentError::MissingValue(verb))?;
    arg.parse::<T>().map_err(|_| IntentError::BadNumber(arg.to_string()))
}

impl FromStr for Intent {
    type Err = IntentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let mut words = lowered.split_whitespace();
        let verb = words.next().ok_or(IntentError::Empty)?;
        let arg = words.next();
        if let Some(extra) = words.next() {
            return Err(IntentError::Trailing { verb: verb.to_string(), extra: extra.to_string() });
        }

        if let Some(key) = Key::from_token(verb) {
            return match arg {
                None => Ok(key.intent()),
                Some(extra) => Err(IntentError::Trailing { verb: verb.to_string(), extra: extra.to_string() }),
            };
        }

        let intent = match verb {
            "connect" => Intent::Connect(arg.map(|port| {
                // Port names are case sensitive on Linux; take them from the raw input.
                s.split_whitespace().nth(1).unwrap_or(port).to_string()
            })),
            "disconnect" => Intent::Disconnect,
            "toggle" => Intent::ToggleConnection,
            "start" => Intent::Start,
            "stop" => Intent::Stop,
            "run" => Intent::ToggleRun,
            "cw" => Intent::Direction(Direction::Cw),
            "ccw" => Intent::Direction(Direction::Ccw),
            "speed" => Intent::SetSpeed(number("speed", arg)?),
            "micro" | "microstep" => {
                Intent::SelectMicrostep(Microstep::try_from(number::<u32>("micro", arg)?)?)
            }
            "profile" => Intent::SelectProfile(Profile::try_from(number::<u8>("profile", arg)?)?),
            other => return Err(IntentError::Unknown(other.to_string())),
        };

        let takes_arg = matches!(verb, "connect" | "speed" | "micro" | "microstep" | "profile");
        match arg {
            Some(extra) if !takes_arg => Err(IntentError::Trailing { verb: verb.to_string(), extra: extra.to_string() }),
            _ => Ok(intent),
        }
    }
}
