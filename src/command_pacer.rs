/// Outbound command pacing
///
/// The board's serial input buffer is small, so commands are queued and
/// released one per tick instead of being written as soon as the operator
/// produces them.

use std::collections::VecDeque;
use std::time::Duration;

use crate::serial_link::MotorLink;

pub const DEFAULT_CMD_TICK: Duration = Duration::from_millis(10);
/// Queue depth at which a warning is logged.
const HIGH_WATER: usize = 256;

#[derive(Debug, Default)]
pub struct CommandPacer {
    queue: VecDeque<String>,
    over_high_water: bool,
}

impl CommandPacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command at the tail. No validation and no bound.
    pub fn enqueue(&mut self, cmd: impl Into<String>) {
        self.queue.push_back(cmd.into());
        if self.queue.len() >= HIGH_WATER && !self.over_high_water {
            self.over_high_water = true;
            log::warn!(target: "command_pacer", "Command queue backed up: {} pending", self.queue.len());
        }
    }

    /// Release at most one command. Without an open link the whole queue is
    /// discarded. Returns the command that was written, if any.
    pub fn tick(&mut self, link: Option<&mut MotorLink>) -> Option<String> {
        let link = match link {
            Some(link) if link.is_open() => link,
            _ => {
                if !self.queue.is_empty() {
                    log::debug!(target: "command_pacer", "No open link, dropping {} queued commands", self.queue.len());
                    self.clear();
                }
                return None;
            }
        };

        let cmd = self.queue.pop_front()?;
        if self.queue.len() < HIGH_WATER {
            self.over_high_water = false;
        }
        match link.send(&cmd) {
            Ok(()) => Some(cmd),
            Err(e) => {
                log::warn!(target: "command_pacer", "Write of '{}' failed, dropped: {}", cmd, e);
                None
            }
        }
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.over_high_water = false;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.queue.iter().map(String::as_str)
    }
}
