/// Motor session controller
///
/// Owns the session state, the outbound command queue, the telemetry window
/// and the serial link. Everything here runs on one thread: the event loop
/// calls `tick_commands` and `tick_telemetry` from its two timers and
/// `apply` for every operator intent.

use crate::command_pacer::CommandPacer;
use crate::intents::Intent;
use crate::protocol::{parse_current, Command, Direction, Microstep, Profile};
use crate::rpm_limit::max_rpm;
use crate::serial_link::{LinkSettings, MotorLink};
use crate::telemetry::TelemetryWindow;

pub const STATUS_DISCONNECTED: &str = "Disconnected";

/// Operator-visible motor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub running: bool,
    pub microstep: Microstep,
    pub profile: Profile,
    pub speed_rpm: u32,
    pub max_rpm: u32,
}

impl SessionState {
    pub fn new(microstep: Microstep, profile: Profile) -> Self {
        Self {
            running: false,
            microstep,
            profile,
            speed_rpm: 0,
            max_rpm: max_rpm(microstep),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(Microstep::default(), Profile::default())
    }
}

pub struct Controller {
    state: SessionState,
    pacer: CommandPacer,
    telemetry: TelemetryWindow,
    link: Option<MotorLink>,
    link_settings: LinkSettings,
    status: String,
}

impl Controller {
    /// `state` is brought back in line with its microstep: the limit is
    /// recomputed, the speed clamped to it, and the motor marked stopped.
    pub fn new(mut state: SessionState, telemetry: TelemetryWindow, link_settings: LinkSettings) -> Self {
        state.running = false;
        state.max_rpm = max_rpm(state.microstep);
        state.speed_rpm = state.speed_rpm.min(state.max_rpm);
        Self {
            state,
            pacer: CommandPacer::new(),
            telemetry,
            link: None,
            link_settings,
            status: STATUS_DISCONNECTED.to_string(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn telemetry(&self) -> &TelemetryWindow {
        &self.telemetry
    }

    pub fn pacer(&self) -> &CommandPacer {
        &self.pacer
    }

    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(MotorLink::is_open)
    }

    pub fn port_name(&self) -> Option<&str> {
        self.link.as_ref().map(MotorLink::port_name)
    }

    fn send(&mut self, cmd: Command) {
        self.pacer.enqueue(cmd.to_string());
    }

    /// Open `port` and push the current settings to the board. Failure is
    /// reported through `status`; returns whether the link is up.
    pub fn connect(&mut self, port: &str) -> bool {
        if self.is_connected() {
            self.disconnect();
        }
        match MotorLink::open(port, &self.link_settings) {
            Ok(link) => {
                self.attach(link);
                true
            }
            Err(e) => {
                log::warn!(target: "controller", "Connection to {} failed: {:#}", port, e);
                self.status = format!("Connection failed: {:#}", e);
                false
            }
        }
    }

    /// Take ownership of an already open link.
    pub fn attach(&mut self, link: MotorLink) {
        self.status = format!("Connected on {}", link.port_name());
        log::info!(target: "controller", "{}", self.status);
        self.link = Some(link);

        self.telemetry.restart();
        self.state.running = false;
        self.state.speed_rpm = 0;

        self.send(Command::Stop);
        self.send(Command::Microstep(self.state.microstep));
        self.send(Command::SetProfile(self.state.profile));
    }

    /// Stop the motor, close the port, and reset the session.
    pub fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.shutdown();
        }
        self.state.running = false;
        self.state.speed_rpm = 0;
        self.telemetry.restart();
        self.status = STATUS_DISCONNECTED.to_string();
        log::info!(target: "controller", "Disconnected");
    }

    pub fn toggle_connection(&mut self, port: &str) {
        if self.is_connected() {
            self.disconnect();
        } else {
            self.connect(port);
        }
    }

    pub fn select_microstep(&mut self, microstep: Microstep) {
        if microstep == self.state.microstep {
            return;
        }
        // Never change resolution while stepping.
        if self.state.running {
            log::info!(target: "controller", "Microstep change while running, stopping motor");
            self.send(Command::Stop);
            self.state.running = false;
            self.state.speed_rpm = 0;
        }
        self.state.microstep = microstep;
        self.send(Command::Microstep(microstep));
        self.update_max_rpm();
    }

    fn update_max_rpm(&mut self) {
        self.state.max_rpm = max_rpm(self.state.microstep);
        log::debug!(target: "controller", "Max RPM: {} at 1/{} microstep", self.state.max_rpm, self.state.microstep);
        if self.state.speed_rpm > self.state.max_rpm {
            self.state.speed_rpm = self.state.max_rpm;
        }
    }

    pub fn select_profile(&mut self, profile: Profile) {
        if profile == self.state.profile {
            return;
        }
        self.state.profile = profile;
        self.send(Command::SetProfile(profile));
    }

    pub fn start(&mut self) {
        self.state.running = true;
        self.send(Command::Start);
        self.send(Command::SetSpeed(self.state.speed_rpm));
    }

    pub fn stop(&mut self) {
        self.state.running = false;
        self.send(Command::Stop);
    }

    pub fn toggle_run(&mut self) {
        if self.state.running {
            self.stop();
        } else {
            self.start();
        }
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.send(Command::Dir(direction));
    }

    /// Set the speed, clamped to the current limit. Only forwarded to the
    /// board while running; `start` sends it otherwise.
    pub fn set_speed(&mut self, rpm: u32) {
        let rpm = rpm.min(self.state.max_rpm);
        self.state.speed_rpm = rpm;
        if self.state.running {
            self.send(Command::SetSpeed(rpm));
        }
    }

    pub fn nudge_speed(&mut self, delta: i32) {
        let target = i64::from(self.state.speed_rpm) + i64::from(delta);
        let target = target.clamp(0, i64::from(self.state.max_rpm));
        self.set_speed(target as u32);
    }

    /// Apply one operator intent. `default_port` backs `Connect(None)` and
    /// `ToggleConnection`.
    pub fn apply(&mut self, intent: Intent, default_port: &str) {
        log::debug!(target: "controller", "Intent: {:?}", intent);
        match intent {
            Intent::ToggleConnection => self.toggle_connection(default_port),
            Intent::Connect(port) => {
                self.connect(port.as_deref().unwrap_or(default_port));
            }
            Intent::Disconnect => self.disconnect(),
            Intent::SelectMicrostep(m) => self.select_microstep(m),
            Intent::SelectProfile(p) => self.select_profile(p),
            Intent::Start => self.start(),
            Intent::Stop => self.stop(),
            Intent::ToggleRun => self.toggle_run(),
            Intent::Direction(d) => self.set_direction(d),
            Intent::SetSpeed(rpm) => self.set_speed(rpm),
            Intent::NudgeSpeed(delta) => self.nudge_speed(delta),
        }
    }

    /// Command timer body: release at most one queued command.
    pub fn tick_commands(&mut self) -> Option<String> {
        self.pacer.tick(self.link.as_mut())
    }

    /// Telemetry timer body: read at most one line and record it if it is a
    /// speed report. Returns the parsed RPM.
    pub fn tick_telemetry(&mut self) -> Option<f64> {
        let line = self.link.as_mut().filter(|l| l.is_open())?.read_line()?;
        match parse_current(&line) {
            Some(rpm) => {
                self.telemetry.append_sample(rpm);
                Some(rpm)
            }
            None => {
                log::trace!(target: "controller", "Ignored line: {}", line);
                None
            }
        }
    }

    /// Exit hook: STOP goes out and the port closes before returning.
    pub fn shutdown(&mut self) {
        if self.link.is_some() {
            log::info!(target: "controller", "Shutting down, stopping motor");
            self.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial_link::mock::{MockTransport, Wire};

    fn controller() -> Controller {
        Controller::new(SessionState::default(), TelemetryWindow::default(), LinkSettings::default())
    }

    fn connected() -> (Controller, Wire) {
        let mut c = controller();
        let (transport, wire) = MockTransport::new();
        c.attach(MotorLink::from_transport("mock", Box::new(transport)));
        (c, wire)
    }

    fn drain(c: &mut Controller) {
        while !c.pacer().is_empty() {
            c.tick_commands();
        }
    }

    fn pending(c: &Controller) -> Vec<String> {
        c.pacer().pending().map(str::to_string).collect()
    }

    #[test]
    fn test_defaults() {
        let c = controller();
        assert_eq!(c.state().microstep, Microstep::Sixteenth);
        assert_eq!(c.state().profile, Profile::Medium);
        assert_eq!(c.state().max_rpm, 95);
        assert_eq!(c.status(), STATUS_DISCONNECTED);
        assert!(!c.is_connected());
    }

    #[test]
    fn test_connect_pushes_settings() {
        let (mut c, wire) = connected();
        assert_eq!(c.status(), "Connected on mock");
        assert_eq!(pending(&c), vec!["STOP", "MICROSTEP:16", "SET_PROFILE:2"]);
        drain(&mut c);
        assert_eq!(wire.written_lines(), vec!["STOP", "MICROSTEP:16", "SET_PROFILE:2"]);
    }

    #[test]
    fn test_connect_failure_sets_status() {
        let mut c = controller();
        assert!(!c.connect("/dev/does-not-exist-stepper"));
        assert!(c.status().starts_with("Connection failed:"));
        assert!(!c.is_connected());
    }

    #[test]
    fn test_start_sends_start_then_speed() {
        let (mut c, wire) = connected();
        drain(&mut c);
        wire.clear_written();

        c.set_speed(60);
        assert!(c.pacer().is_empty(), "speed is not sent while stopped");
        c.start();
        c.set_speed(70);
        drain(&mut c);
        assert!(c.state().running);
        assert_eq!(wire.written_lines(), vec!["START", "SET_SPEED:60", "SET_SPEED:70"]);
    }

    #[test]
    fn test_microstep_change_while_running_stops_first() {
        let (mut c, wire) = connected();
        drain(&mut c);
        wire.clear_written();

        c.set_speed(90);
        c.start();
        c.select_microstep(Microstep::ThirtySecond);
        drain(&mut c);

        assert!(!c.state().running);
        assert_eq!(c.state().speed_rpm, 0);
        assert_eq!(c.state().max_rpm, 45);
        assert_eq!(
            wire.written_lines(),
            vec!["START", "SET_SPEED:90", "STOP", "MICROSTEP:32"]
        );
    }

    #[test]
    fn test_microstep_change_clamps_speed() {
        let mut c = controller();
        c.set_speed(90);
        c.select_microstep(Microstep::SixtyFourth);
        assert_eq!(c.state().max_rpm, 25);
        assert_eq!(c.state().speed_rpm, 25);
        assert_eq!(pending(&c), vec!["MICROSTEP:64"]);
    }

    #[test]
    fn test_same_microstep_is_noop() {
        let mut c = controller();
        c.select_microstep(Microstep::Sixteenth);
        assert!(c.pacer().is_empty());
    }

    #[test]
    fn test_speed_never_exceeds_max() {
        let mut c = controller();
        c.set_speed(10_000);
        assert_eq!(c.state().speed_rpm, 95);
        c.nudge_speed(5);
        assert_eq!(c.state().speed_rpm, 95);
        c.apply(Intent::NudgeSpeed(-500), "mock");
        assert_eq!(c.state().speed_rpm, 0);
        c.apply(Intent::SelectMicrostep(Microstep::Full), "mock");
        c.apply(Intent::SetSpeed(1400), "mock");
        assert_eq!(c.state().speed_rpm, 1400);
        c.apply(Intent::SelectMicrostep(Microstep::Eighth), "mock");
        assert_eq!(c.state().speed_rpm, 190);
    }

    #[test]
    fn test_toggle_run_and_direction() {
        let mut c = controller();
        c.apply(Intent::ToggleRun, "mock");
        assert!(c.state().running);
        c.apply(Intent::Direction(Direction::Ccw), "mock");
        c.apply(Intent::ToggleRun, "mock");
        assert!(!c.state().running);
        assert_eq!(pending(&c), vec!["START", "SET_SPEED:0", "DIR:CCW", "STOP"]);
    }

    #[test]
    fn test_profile_change() {
        let mut c = controller();
        c.apply(Intent::SelectProfile(Profile::Soft), "mock");
        assert_eq!(c.state().profile, Profile::Soft);
        assert_eq!(pending(&c), vec!["SET_PROFILE:1"]);
    }

    #[test]
    fn test_same_profile_is_noop() {
        let mut c = controller();
        c.select_profile(Profile::Medium);
        assert!(c.pacer().is_empty());
    }

    #[test]
    fn test_new_normalizes_inconsistent_state() {
        let state = SessionState {
            running: true,
            microstep: Microstep::Sixteenth,
            profile: Profile::Medium,
            speed_rpm: 500,
            max_rpm: 9999,
        };
        let mut c = Controller::new(state, TelemetryWindow::default(), LinkSettings::default());
        assert!(!c.state().running);
        assert_eq!(c.state().max_rpm, 95);
        assert_eq!(c.state().speed_rpm, 95);

        let (transport, wire) = MockTransport::new();
        c.attach(MotorLink::from_transport("mock", Box::new(transport)));
        c.set_speed(400);
        c.start();
        drain(&mut c);
        assert_eq!(
            wire.written_lines(),
            vec!["STOP", "MICROSTEP:16", "SET_PROFILE:2", "START", "SET_SPEED:95"]
        );
    }

    #[test]
    fn test_commands_dropped_without_link() {
        let mut c = controller();
        c.start();
        assert_eq!(c.tick_commands(), None);
        assert!(c.pacer().is_empty());
    }

    #[test]
    fn test_disconnect_stops_before_queue() {
        let (mut c, wire) = connected();
        drain(&mut c);
        wire.clear_written();

        c.set_speed(50);
        c.start();
        c.tick_commands();
        c.disconnect();

        // START went out on the tick, STOP right away, SET_SPEED never.
        assert_eq!(wire.written_lines(), vec!["START", "STOP"]);
        assert_eq!(c.tick_commands(), None);
        assert!(c.pacer().is_empty());
        assert!(!c.state().running);
        assert_eq!(c.state().speed_rpm, 0);
        assert_eq!(c.status(), STATUS_DISCONNECTED);
    }

    #[test]
    fn test_telemetry_ingest() {
        let (mut c, wire) = connected();
        wire.push_inbound("BOOT OK\nCURRENT:10.5\nCURRENT:bad\nCURRENT:11\n");
        assert_eq!(c.tick_telemetry(), None);
        assert_eq!(c.tick_telemetry(), Some(10.5));
        assert_eq!(c.tick_telemetry(), None);
        assert_eq!(c.tick_telemetry(), Some(11.0));
        assert_eq!(c.tick_telemetry(), None);

        let points = c.telemetry().points();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0], [0.0, 10.5]);
    }

    #[test]
    fn test_reconnect_restarts_telemetry() {
        let (mut c, wire) = connected();
        wire.push_inbound("CURRENT:1\nCURRENT:2\n");
        c.tick_telemetry();
        c.tick_telemetry();
        assert_eq!(c.telemetry().len(), 2);

        c.disconnect();
        assert!(c.telemetry().is_empty());
        assert_eq!(c.tick_telemetry(), None);

        let (transport, wire) = MockTransport::new();
        c.attach(MotorLink::from_transport("mock2", Box::new(transport)));
        wire.push_inbound("CURRENT:3\n");
        c.tick_telemetry();
        assert_eq!(c.telemetry().points(), vec![[0.0, 3.0]]);
    }

    #[test]
    fn test_shutdown_sends_stop() {
        let (mut c, wire) = connected();
        c.start();
        c.shutdown();
        assert_eq!(wire.written_lines(), vec!["STOP"]);
        assert!(!c.is_connected());
        // A second shutdown has nothing left to do.
        c.shutdown();
        assert_eq!(wire.written_lines(), vec!["STOP"]);
    }
}
