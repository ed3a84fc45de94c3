pub mod csvlog;
pub mod group;
pub mod timer;
pub mod vars;

pub use csvlog::CsvLog;
pub use group::{match_id, MatchGroup, MatchState, MATCH_MAX_COUNT};
pub use timer::Timer;
pub use vars::TemplateCtx;

use anyhow::Result;
use chrono::Local;
use image::GrayImage;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use catcierge_events::EventSink;
use catcierge_gpio::Actuator;
use catcierge_rfid::{RfidCorrelator, TagRead};
use catcierge_vision::{Direction, Matcher};

/// Heartbeat logging interval, seconds.
const STATUS_INTERVAL: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Waiting,
    Matching,
    KeepOpen,
    Lockout,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Waiting => "Waiting",
            State::Matching => "Matching",
            State::KeepOpen => "Keep open",
            State::Lockout => "Lockout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum LockoutMethod {
    /// Timer starts at lockout entry; the lockout ends when the frame
    /// clears or the timer elapses.
    ObstructOrTimer,
    /// Timer starts once the frame first clears, then runs to completion.
    ObstructThenTimer,
    /// Timer starts at entry and must run to completion.
    TimerOnly,
}

impl LockoutMethod {
    pub fn number(&self) -> u8 {
        match self {
            LockoutMethod::ObstructOrTimer => 1,
            LockoutMethod::ObstructThenTimer => 2,
            LockoutMethod::TimerOnly => 3,
        }
    }
}

impl TryFrom<u8> for LockoutMethod {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(LockoutMethod::ObstructOrTimer),
            2 => Ok(LockoutMethod::ObstructThenTimer),
            3 => Ok(LockoutMethod::TimerOnly),
            other => Err(format!("lockout_method must be 1-3, got {}", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FsmConfig {
    /// Rematch window after a successful group, seconds.
    pub match_time: f64,

    pub lockout_time: f64,
    pub lockout_method: LockoutMethod,

    /// Consecutive-lockout watchdog threshold; 0 disables it.
    pub max_consecutive_lockout_count: u32,
    pub consecutive_lockout_delay: f64,

    /// Frame successes required for a group success (unless leaving).
    pub ok_matches_needed: u32,

    pub saveimg: bool,
    pub save_steps: bool,
    pub highlight_match: bool,
    pub output_path: String,

    /// Make do_lockout a no-op, for test rigs without an actuator.
    pub lockout_dummy: bool,

    pub rfid_inner_configured: bool,
    pub rfid_outer_configured: bool,

    /// How long into KeepOpen both readers get before the RFID verdict.
    pub rfid_lock_time: f64,
    pub lock_on_invalid_rfid: bool,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            match_time: 30.0,
            lockout_time: 30.0,
            lockout_method: LockoutMethod::ObstructOrTimer,
            max_consecutive_lockout_count: 0,
            consecutive_lockout_delay: 3.0,
            ok_matches_needed: 2,
            saveimg: true,
            save_steps: false,
            highlight_match: false,
            output_path: ".".into(),
            lockout_dummy: false,
            rfid_inner_configured: false,
            rfid_outer_configured: false,
            rfid_lock_time: 2.0,
            lock_on_invalid_rfid: false,
        }
    }
}

/// The frame-driven decision engine. One `tick` per captured frame; RFID
/// reads are fed in between ticks on the same thread.
pub struct Fsm {
    cfg: FsmConfig,
    matcher: Box<dyn Matcher>,
    actuator: Box<dyn Actuator>,
    csv: CsvLog,

    state: State,
    prev_state: State,
    group: MatchGroup,

    lockout_timer: Timer,
    rematch_timer: Timer,
    status_timer: Timer,

    consecutive_lockout_count: u32,
    rfid: RfidCorrelator,
    checked_rfid_lock: bool,
    running: bool,
}

impl Fsm {
    pub fn new(
        cfg: FsmConfig,
        matcher: Box<dyn Matcher>,
        actuator: Box<dyn Actuator>,
        csv: CsvLog,
        allowed_tags: Vec<String>,
    ) -> Self {
        Self {
            cfg,
            matcher,
            actuator,
            csv,
            state: State::Waiting,
            prev_state: State::Waiting,
            group: MatchGroup::new(),
            lockout_timer: Timer::new(),
            rematch_timer: Timer::new(),
            status_timer: Timer::new(),
            consecutive_lockout_count: 0,
            rfid: RfidCorrelator::new(allowed_tags),
            checked_rfid_lock: false,
            running: true,
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn consecutive_lockout_count(&self) -> u32 {
        self.consecutive_lockout_count
    }

    /// Frozen variable source for template rendering, capturing this instant.
    pub fn template_ctx(&self) -> TemplateCtx<'_> {
        TemplateCtx {
            state: self.state,
            prev_state: self.prev_state,
            cfg: &self.cfg,
            matcher_kind: self.matcher.kind(),
            group: &self.group,
            now: Local::now(),
        }
    }

    fn emit(&self, events: &mut dyn EventSink, name: &str) {
        events.emit(name, &self.template_ctx());
    }

    fn set_state(&mut self, new: State, events: &mut dyn EventSink) {
        info!("[{}] -> [{}]", self.state.name(), new.name());
        self.prev_state = self.state;
        self.state = new;
        self.emit(events, "state_change");
    }

    /// One framed read off a serial reader. Runs the correlator and fires
    /// `rfid_detect` when a side triggers.
    pub fn handle_rfid(&mut self, read: &TagRead, events: &mut dyn EventSink) {
        if let Some(det) = self.rfid.handle(read) {
            info!(
                "{} RFID: {} ({}allowed{})",
                det.side.name(),
                det.data,
                if det.is_allowed { "" } else { "not " },
                if det.complete { "" } else { ", incomplete" },
            );
            self.emit(events, "rfid_detect");
        }
    }

    /// Run the state function for this frame. An `Err` is a per-frame
    /// failure: the caller logs it and skips the tick; no transition is
    /// taken on an error path.
    pub fn tick(&mut self, frame: &GrayImage, events: &mut dyn EventSink) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.heartbeat();
        match self.state {
            State::Waiting => self.state_waiting(frame, events),
            State::Matching => self.state_matching(frame, events),
            State::KeepOpen => self.state_keepopen(frame, events),
            State::Lockout => self.state_lockout(frame, events),
        }
    }

    /// Final unlock on shutdown, whatever state we are in.
    pub fn final_unlock(&mut self, events: &mut dyn EventSink) {
        self.do_unlock(events);
    }

    fn heartbeat(&mut self) {
        if !self.status_timer.is_active() {
            self.status_timer.set(STATUS_INTERVAL);
            self.status_timer.start();
        } else if self.status_timer.timed_out() {
            debug!(
                "state={} match_count={} consecutive_lockouts={}",
                self.state.name(),
                self.group.len(),
                self.consecutive_lockout_count
            );
            self.status_timer.start();
        }
    }

    // --- States ---

    fn state_waiting(&mut self, frame: &GrayImage, events: &mut dyn EventSink) -> Result<()> {
        let obstructed = self.matcher.is_frame_obstructed(frame)?;
        if obstructed {
            info!("something is in the door, starting match");
            self.group.reset();
            self.set_state(State::Matching, events);
        }
        Ok(())
    }

    fn state_matching(&mut self, frame: &GrayImage, events: &mut dyn EventSink) -> Result<()> {
        let result = self.matcher.match_frame(frame, self.cfg.save_steps)?;

        let mut m = MatchState::new(frame, result, Local::now(), self.cfg.saveimg);
        if self.cfg.saveimg {
            m.assign_paths(&self.cfg.output_path, self.group.len(), self.cfg.save_steps);
        }

        info!(
            "{} {} - {} ({})",
            if m.result.success { "Match" } else { "No match" },
            m.result.direction,
            m.result.description,
            &m.id[..8.min(m.id.len())]
        );
        self.csv.log_match(
            m.result.success,
            m.result.score,
            self.matcher.success_threshold(),
            if self.cfg.saveimg { Some(m.path.as_str()) } else { None },
            m.result.direction,
        );

        self.group.push(m);
        self.emit(events, "match");

        if !self.group.is_full() {
            return Ok(());
        }

        self.group
            .evaluate(self.matcher.direction_policy(), self.cfg.ok_matches_needed as usize);

        if self.group.success {
            info!(
                "group success: {}/{} frames ok, direction {}",
                self.group.success_count,
                MATCH_MAX_COUNT,
                self.group.direction
            );
            self.do_unlock(events);
            self.rematch_timer.set(self.cfg.match_time);
            self.rematch_timer.reset();
            self.checked_rfid_lock = false;
            self.consecutive_lockout_count = 0;
            self.set_state(State::KeepOpen, events);
        } else {
            info!(
                "group failure: {}/{} frames ok, direction {}",
                self.group.success_count,
                MATCH_MAX_COUNT,
                self.group.direction
            );
            self.transition_lockout(events);
        }

        self.emit(events, "match_done");

        if self.cfg.saveimg {
            self.save_images(events);
        }

        Ok(())
    }

    fn state_keepopen(&mut self, frame: &GrayImage, events: &mut dyn EventSink) -> Result<()> {
        // Wait for the doorway to clear before the rematch window starts.
        if !self.rematch_timer.is_active() {
            let obstructed = self.matcher.is_frame_obstructed(frame)?;
            if obstructed {
                return Ok(());
            }
            info!("frame is clear, starting rematch timer");
            self.rematch_timer.start();
        }

        if self.rematch_timer.timed_out() {
            info!("rematch window over, back to waiting");
            self.rfid.reset();
            self.set_state(State::Waiting, events);
            return Ok(());
        }

        self.should_we_rfid_lockout(events);
        Ok(())
    }

    fn state_lockout(&mut self, frame: &GrayImage, events: &mut dyn EventSink) -> Result<()> {
        match self.cfg.lockout_method {
            LockoutMethod::ObstructOrTimer => {
                let obstructed = self.matcher.is_frame_obstructed(frame)?;
                if !obstructed || self.lockout_timer.timed_out() {
                    self.end_lockout(events);
                }
            }
            LockoutMethod::ObstructThenTimer => {
                if !self.lockout_timer.is_active() {
                    let obstructed = self.matcher.is_frame_obstructed(frame)?;
                    if !obstructed {
                        info!("frame is clear, starting lockout timer");
                        self.lockout_timer.start();
                    }
                    return Ok(());
                }
                if self.lockout_timer.timed_out() {
                    self.end_lockout(events);
                }
            }
            LockoutMethod::TimerOnly => {
                if self.lockout_timer.timed_out() {
                    self.end_lockout(events);
                }
            }
        }
        Ok(())
    }

    // --- Transitions and helpers ---

    /// Enter Lockout. The watchdog reads the lockout timer before it is
    /// restarted, measuring the gap since the previous lockout began.
    fn transition_lockout(&mut self, events: &mut dyn EventSink) {
        self.check_max_consecutive_lockouts(events);

        self.lockout_timer.set(self.cfg.lockout_time);
        match self.cfg.lockout_method {
            LockoutMethod::ObstructThenTimer => self.lockout_timer.reset(),
            LockoutMethod::ObstructOrTimer | LockoutMethod::TimerOnly => {
                self.lockout_timer.start();
            }
        }

        self.do_lockout(events);
        self.set_state(State::Lockout, events);
    }

    fn end_lockout(&mut self, events: &mut dyn EventSink) {
        info!("lockout over");
        self.do_unlock(events);
        self.set_state(State::Waiting, events);
    }

    /// Repeated lockouts in quick succession mean the environment is broken
    /// (a failed backlight locks every frame): abort rather than trap the
    /// cat outside.
    fn check_max_consecutive_lockouts(&mut self, events: &mut dyn EventSink) {
        if self.cfg.max_consecutive_lockout_count == 0 {
            return;
        }

        let since_last = self.lockout_timer.elapsed();
        let window = self.cfg.lockout_time + self.cfg.consecutive_lockout_delay;

        if since_last <= window {
            self.consecutive_lockout_count += 1;
            info!(
                "consecutive lockout {} of {} ({:.2}s <= {:.2}s)",
                self.consecutive_lockout_count,
                self.cfg.max_consecutive_lockout_count,
                since_last,
                window
            );
        } else {
            info!(
                "consecutive lockout count reset, {:.2}s since the last one",
                since_last
            );
            self.consecutive_lockout_count = 0;
        }

        if self.consecutive_lockout_count >= self.cfg.max_consecutive_lockout_count {
            error!(
                "too many lockouts in a row ({}), something is wrong - aborting",
                self.consecutive_lockout_count
            );
            self.do_unlock(events);
            self.running = false;
        }
    }

    /// Evaluate the RFID verdict once per KeepOpen episode, after both
    /// readers have had `rfid_lock_time` to see the tag.
    fn should_we_rfid_lockout(&mut self, events: &mut dyn EventSink) {
        if !self.cfg.lock_on_invalid_rfid || self.checked_rfid_lock {
            return;
        }
        if !self.cfg.rfid_inner_configured && !self.cfg.rfid_outer_configured {
            return;
        }
        if self.rematch_timer.elapsed() < self.cfg.rfid_lock_time {
            return;
        }

        if !self.rfid.in_match().triggered && !self.rfid.out_match().triggered {
            warn!("unknown RFID direction, no reader triggered");
            self.rfid.set_unknown_direction();
        }

        let do_lockout = match (self.cfg.rfid_inner_configured, self.cfg.rfid_outer_configured) {
            (true, true) => {
                // One correct read on either side is enough.
                !(self.rfid.in_match().is_allowed || self.rfid.out_match().is_allowed)
            }
            (true, false) => !self.rfid.in_match().is_allowed,
            _ => !self.rfid.out_match().is_allowed,
        };

        if do_lockout {
            if self.rfid.direction() == Direction::Out {
                info!("RFID lockout skipped: cat is going out");
            } else {
                info!("RFID lockout!");
                self.csv.log_rfid_check(false);
                self.rfid.reset();
                self.transition_lockout(events);
            }
        } else {
            info!("RFID ok");
            self.csv.log_rfid_check(true);
        }

        self.emit(events, "rfid_match");
        self.checked_rfid_lock = true;
    }

    /// Lock the door, through the configured command or the actuator.
    fn do_lockout(&mut self, events: &mut dyn EventSink) {
        if self.cfg.lockout_dummy {
            info!("lockout dummy, door stays open");
            return;
        }
        if events.has_command("do_lockout") {
            self.emit(events, "do_lockout");
        } else if let Err(e) = self.actuator.lock() {
            error!("lock failed: {:#}", e);
        }
    }

    fn do_unlock(&mut self, events: &mut dyn EventSink) {
        if events.has_command("do_unlock") {
            self.emit(events, "do_unlock");
        } else if let Err(e) = self.actuator.unlock() {
            error!("unlock failed: {:#}", e);
        }
    }

    /// Persist the group's images, one `save_img` per file and a final
    /// `save_imgs`. Write failures are logged and skipped; the images are
    /// released either way.
    fn save_images(&mut self, events: &mut dyn EventSink) {
        for i in 0..self.group.len() {
            let highlight = self.cfg.highlight_match;
            let save_steps = self.cfg.save_steps;

            if let Some(m) = self.group.get_mut(i) {
                if let Some(img) = &m.img {
                    let mut out = img.clone();
                    if highlight {
                        for r in &m.result.rects {
                            imageproc::drawing::draw_hollow_rect_mut(
                                &mut out,
                                imageproc::rect::Rect::at(r.x, r.y).of_size(r.width, r.height),
                                image::Luma([255u8]),
                            );
                        }
                    }

                    info!("saving image {}", m.path);
                    if let Some(dir) = std::path::Path::new(&m.path).parent() {
                        if let Err(e) = std::fs::create_dir_all(dir) {
                            warn!("create {}: {}", dir.display(), e);
                        }
                    }
                    if let Err(e) = out.save(&m.path) {
                        warn!("save {} failed: {}", m.path, e);
                    }

                    if save_steps {
                        for step in &m.result.steps {
                            if let Some(simg) = &step.img {
                                if let Err(e) = simg.save(&step.path) {
                                    warn!("save step {} failed: {}", step.path, e);
                                }
                            }
                        }
                    }
                }
            }

            self.emit(events, "save_img");

            if let Some(m) = self.group.get_mut(i) {
                m.release_image();
            }
        }

        self.emit(events, "save_imgs");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catcierge_events::VarSource;
    use catcierge_rfid::ReaderSide;
    use catcierge_vision::{DirectionPolicy, MatchResult};
    use image::Luma;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct ScriptMatcher {
        results: VecDeque<MatchResult>,
        obstructed: std::cell::RefCell<VecDeque<bool>>,
        policy: DirectionPolicy,
    }

    impl ScriptMatcher {
        fn new(policy: DirectionPolicy) -> Self {
            Self {
                results: VecDeque::new(),
                obstructed: std::cell::RefCell::new(VecDeque::new()),
                policy,
            }
        }

        fn verdicts(mut self, verdicts: &[(f64, bool, Direction)]) -> Self {
            for &(score, success, direction) in verdicts {
                self.results.push_back(MatchResult {
                    success,
                    score,
                    direction,
                    description: "scripted".into(),
                    ..Default::default()
                });
            }
            self
        }

        fn probes(self, probes: &[bool]) -> Self {
            self.obstructed.borrow_mut().extend(probes.iter().copied());
            self
        }
    }

    impl Matcher for ScriptMatcher {
        fn kind(&self) -> &'static str {
            "template"
        }

        fn success_threshold(&self) -> f64 {
            0.8
        }

        fn direction_policy(&self) -> DirectionPolicy {
            self.policy
        }

        fn match_frame(&mut self, _frame: &GrayImage, _steps: bool) -> Result<MatchResult> {
            self.results
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("matcher script exhausted"))
        }

        /// Scripted probes consume in order; an exhausted script reads clear.
        fn is_frame_obstructed(&self, _frame: &GrayImage) -> Result<bool> {
            Ok(self.obstructed.borrow_mut().pop_front().unwrap_or(false))
        }
    }

    #[derive(Clone, Default)]
    struct Counts(Arc<Mutex<(u32, u32)>>);

    impl Counts {
        fn locks(&self) -> u32 {
            self.0.lock().unwrap().0
        }

        fn unlocks(&self) -> u32 {
            self.0.lock().unwrap().1
        }
    }

    struct TestActuator(Counts);

    impl Actuator for TestActuator {
        fn lock(&mut self) -> Result<()> {
            self.0 .0.lock().unwrap().0 += 1;
            Ok(())
        }

        fn unlock(&mut self) -> Result<()> {
            self.0 .0.lock().unwrap().1 += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl EventSink for Recorder {
        fn emit(&mut self, event: &str, _vars: &dyn VarSource) {
            self.events.push(event.to_string());
        }
    }

    impl Recorder {
        fn count(&self, name: &str) -> usize {
            self.events.iter().filter(|e| e == &name).count()
        }
    }

    fn frame() -> GrayImage {
        GrayImage::from_pixel(8, 8, Luma([128]))
    }

    fn build(cfg: FsmConfig, matcher: ScriptMatcher, tags: Vec<String>) -> (Fsm, Counts) {
        let counts = Counts::default();
        let fsm = Fsm::new(
            cfg,
            Box::new(matcher),
            Box::new(TestActuator(counts.clone())),
            CsvLog::disabled(),
            tags,
        );
        (fsm, counts)
    }

    fn run_ticks(fsm: &mut Fsm, events: &mut Recorder, n: usize) {
        for _ in 0..n {
            fsm.tick(&frame(), events).unwrap();
        }
    }

    fn base_cfg() -> FsmConfig {
        FsmConfig { saveimg: false, ..FsmConfig::default() }
    }

    #[test]
    fn clean_entry_unlocks_and_keeps_open() {
        let matcher = ScriptMatcher::new(DirectionPolicy::LastSuccess)
            .verdicts(&[
                (0.92, true, Direction::In),
                (0.95, true, Direction::In),
                (0.88, true, Direction::In),
                (0.94, true, Direction::In),
            ])
            .probes(&[true]);
        let (mut fsm, counts) = build(base_cfg(), matcher, vec![]);
        fsm.consecutive_lockout_count = 2;

        let mut events = Recorder::default();
        run_ticks(&mut fsm, &mut events, 5);

        assert_eq!(fsm.state(), State::KeepOpen);
        assert!(fsm.group.success);
        assert_eq!(fsm.group.success_count, 4);
        assert_eq!(fsm.group.direction, Direction::In);
        assert_eq!(counts.unlocks(), 1, "exactly one unlock on entry");
        assert_eq!(counts.locks(), 0);
        assert_eq!(fsm.consecutive_lockout_count(), 0, "success resets the watchdog");
        assert_eq!(events.count("match"), 4);
        assert_eq!(events.count("match_done"), 1);
        assert!(fsm.rematch_timer.duration() == fsm.cfg.match_time);
        assert!(!fsm.rematch_timer.is_active(), "rematch timer armed, not started");
    }

    #[test]
    fn prey_rejection_locks_out() {
        let matcher = ScriptMatcher::new(DirectionPolicy::Plurality)
            .verdicts(&[
                (0.0, false, Direction::In),
                (1.0, true, Direction::In),
                (0.0, false, Direction::In),
                (0.0, false, Direction::In),
            ])
            .probes(&[true]);
        let (mut fsm, counts) = build(base_cfg(), matcher, vec![]);

        let mut events = Recorder::default();
        run_ticks(&mut fsm, &mut events, 5);

        assert_eq!(fsm.state(), State::Lockout);
        assert!(!fsm.group.success);
        assert_eq!(fsm.group.success_count, 1);
        assert_eq!(counts.locks(), 1);
        assert_eq!(counts.unlocks(), 0);
        assert_eq!(events.count("match_done"), 1);
    }

    #[test]
    fn going_out_passes_with_zero_successes() {
        let matcher = ScriptMatcher::new(DirectionPolicy::Plurality)
            .verdicts(&[
                (0.999, false, Direction::Out),
                (0.999, false, Direction::Out),
                (0.999, false, Direction::Out),
                (0.999, false, Direction::Unknown),
            ])
            .probes(&[true]);
        let (mut fsm, counts) = build(base_cfg(), matcher, vec![]);

        let mut events = Recorder::default();
        run_ticks(&mut fsm, &mut events, 5);

        assert_eq!(fsm.state(), State::KeepOpen);
        assert!(fsm.group.success, "leaving is never blocked");
        assert_eq!(fsm.group.direction, Direction::Out);
        assert_eq!(fsm.group.success_count, 0);
        assert_eq!(counts.unlocks(), 1);
    }

    fn failing_cycle() -> Vec<(f64, bool, Direction)> {
        vec![
            (0.1, false, Direction::In),
            (0.1, false, Direction::In),
            (0.1, false, Direction::In),
            (0.1, false, Direction::In),
        ]
    }

    #[test]
    fn watchdog_trips_after_three_rapid_lockouts() {
        let mut verdicts = Vec::new();
        for _ in 0..3 {
            verdicts.extend(failing_cycle());
        }
        let matcher = ScriptMatcher::new(DirectionPolicy::Plurality)
            .verdicts(&verdicts)
            .probes(&[true, false, true, false, true]);
        let cfg = FsmConfig {
            max_consecutive_lockout_count: 3,
            lockout_time: 30.0,
            consecutive_lockout_delay: 5.0,
            ..base_cfg()
        };
        let (mut fsm, counts) = build(cfg, matcher, vec![]);
        let mut events = Recorder::default();

        // First failing group: lockout entry at t=0, counter goes to 1.
        run_ticks(&mut fsm, &mut events, 5);
        assert_eq!(fsm.state(), State::Lockout);
        assert_eq!(fsm.consecutive_lockout_count(), 1);

        // Frame clears, lockout ends; 32s later the next group fails.
        run_ticks(&mut fsm, &mut events, 1);
        assert_eq!(fsm.state(), State::Waiting);
        fsm.lockout_timer.advance(32.0);
        run_ticks(&mut fsm, &mut events, 5);
        assert_eq!(fsm.consecutive_lockout_count(), 2);
        assert!(fsm.running());

        run_ticks(&mut fsm, &mut events, 1);
        fsm.lockout_timer.advance(32.0);
        run_ticks(&mut fsm, &mut events, 5);

        assert_eq!(fsm.consecutive_lockout_count(), 3);
        assert!(!fsm.running(), "watchdog must clear the run flag");
        assert!(counts.unlocks() >= 1, "final unlock on abort");
    }

    #[test]
    fn spaced_lockouts_reset_the_watchdog() {
        let mut verdicts = failing_cycle();
        verdicts.extend(failing_cycle());
        let matcher = ScriptMatcher::new(DirectionPolicy::Plurality)
            .verdicts(&verdicts)
            .probes(&[true, false, true]);
        let cfg = FsmConfig {
            max_consecutive_lockout_count: 2,
            lockout_time: 30.0,
            consecutive_lockout_delay: 5.0,
            ..base_cfg()
        };
        let (mut fsm, _counts) = build(cfg, matcher, vec![]);
        let mut events = Recorder::default();

        run_ticks(&mut fsm, &mut events, 6);
        assert_eq!(fsm.consecutive_lockout_count(), 1);

        // Well past lockout_time + delay: the counter resets instead of
        // incrementing.
        fsm.lockout_timer.advance(40.0);
        run_ticks(&mut fsm, &mut events, 5);
        assert_eq!(fsm.consecutive_lockout_count(), 0);
        assert!(fsm.running());
    }

    fn keepopen_rfid_cfg(inner: bool, outer: bool) -> FsmConfig {
        FsmConfig {
            lock_on_invalid_rfid: true,
            rfid_inner_configured: inner,
            rfid_outer_configured: outer,
            rfid_lock_time: 2.0,
            ..base_cfg()
        }
    }

    fn passing_matcher() -> ScriptMatcher {
        ScriptMatcher::new(DirectionPolicy::LastSuccess)
            .verdicts(&[
                (0.9, true, Direction::In),
                (0.9, true, Direction::In),
                (0.9, true, Direction::In),
                (0.9, true, Direction::In),
            ])
            .probes(&[true, false])
    }

    fn tag(side: ReaderSide, data: &str) -> TagRead {
        TagRead { side, complete: true, data: data.into() }
    }

    #[test]
    fn allowed_rfid_keeps_the_door_open() {
        let cfg = keepopen_rfid_cfg(true, false);
        let (mut fsm, counts) = build(cfg, passing_matcher(), vec!["GOODCAT".into()]);
        let mut events = Recorder::default();

        run_ticks(&mut fsm, &mut events, 5);
        assert_eq!(fsm.state(), State::KeepOpen);

        fsm.handle_rfid(&tag(ReaderSide::Inner, "GOODCAT"), &mut events);
        assert_eq!(events.count("rfid_detect"), 1);

        // Clear frame starts the rematch timer; the verdict waits for
        // rfid_lock_time.
        run_ticks(&mut fsm, &mut events, 1);
        assert_eq!(events.count("rfid_match"), 0);

        fsm.rematch_timer.advance(2.5);
        run_ticks(&mut fsm, &mut events, 2);

        assert_eq!(fsm.state(), State::KeepOpen, "allowed tag must not lock");
        assert_eq!(events.count("rfid_match"), 1, "verdict fires exactly once");
        assert_eq!(counts.locks(), 0);
    }

    #[test]
    fn invalid_rfid_going_in_locks_out() {
        let cfg = keepopen_rfid_cfg(true, true);
        let (mut fsm, counts) = build(cfg, passing_matcher(), vec!["GOODCAT".into()]);
        let mut events = Recorder::default();

        run_ticks(&mut fsm, &mut events, 5);

        // Outer first, inner second: direction IN.
        fsm.handle_rfid(&tag(ReaderSide::Outer, "STRANGER"), &mut events);
        fsm.handle_rfid(&tag(ReaderSide::Inner, "STRANGER"), &mut events);

        run_ticks(&mut fsm, &mut events, 1);
        fsm.rematch_timer.advance(2.5);
        run_ticks(&mut fsm, &mut events, 1);

        assert_eq!(fsm.state(), State::Lockout);
        assert_eq!(counts.locks(), 1);
        assert_eq!(events.count("rfid_match"), 1);
    }

    #[test]
    fn invalid_rfid_going_out_is_not_locked() {
        let cfg = keepopen_rfid_cfg(true, true);
        let (mut fsm, counts) = build(cfg, passing_matcher(), vec![]);
        let mut events = Recorder::default();

        run_ticks(&mut fsm, &mut events, 5);

        // Inner first, outer second: direction OUT, lockout skipped.
        fsm.handle_rfid(&tag(ReaderSide::Inner, "STRANGER"), &mut events);
        fsm.handle_rfid(&tag(ReaderSide::Outer, "STRANGER"), &mut events);

        run_ticks(&mut fsm, &mut events, 1);
        fsm.rematch_timer.advance(2.5);
        run_ticks(&mut fsm, &mut events, 1);

        assert_eq!(fsm.state(), State::KeepOpen);
        assert_eq!(counts.locks(), 0);
        assert_eq!(events.count("rfid_match"), 1);
    }

    #[test]
    fn keepopen_returns_to_waiting_after_match_time() {
        let (mut fsm, _counts) = build(base_cfg(), passing_matcher(), vec![]);
        let mut events = Recorder::default();

        run_ticks(&mut fsm, &mut events, 6);
        assert_eq!(fsm.state(), State::KeepOpen);
        assert!(fsm.rematch_timer.is_active());

        fsm.rematch_timer.advance(31.0);
        run_ticks(&mut fsm, &mut events, 1);
        assert_eq!(fsm.state(), State::Waiting);
    }

    #[test]
    fn lockout_method_two_waits_for_clear_frame() {
        let matcher = ScriptMatcher::new(DirectionPolicy::Plurality)
            .verdicts(&failing_cycle())
            .probes(&[true, true, true, false]);
        let cfg = FsmConfig {
            lockout_method: LockoutMethod::ObstructThenTimer,
            ..base_cfg()
        };
        let (mut fsm, _counts) = build(cfg, matcher, vec![]);
        let mut events = Recorder::default();

        run_ticks(&mut fsm, &mut events, 5);
        assert_eq!(fsm.state(), State::Lockout);
        assert!(!fsm.lockout_timer.is_active(), "timer waits for a clear frame");

        // Still obstructed: timer stays off.
        run_ticks(&mut fsm, &mut events, 2);
        assert!(!fsm.lockout_timer.is_active());

        // Frame clears: timer starts, runs to lockout_time.
        run_ticks(&mut fsm, &mut events, 1);
        assert!(fsm.lockout_timer.is_active());
        assert_eq!(fsm.state(), State::Lockout);

        fsm.lockout_timer.advance(31.0);
        run_ticks(&mut fsm, &mut events, 1);
        assert_eq!(fsm.state(), State::Waiting);
    }

    #[test]
    fn lockout_method_three_ignores_clear_frames() {
        let matcher = ScriptMatcher::new(DirectionPolicy::Plurality)
            .verdicts(&failing_cycle())
            .probes(&[true]);
        let cfg = FsmConfig { lockout_method: LockoutMethod::TimerOnly, ..base_cfg() };
        let (mut fsm, _counts) = build(cfg, matcher, vec![]);
        let mut events = Recorder::default();

        run_ticks(&mut fsm, &mut events, 5);
        assert_eq!(fsm.state(), State::Lockout);

        // Clear frames change nothing before the timer runs out.
        run_ticks(&mut fsm, &mut events, 3);
        assert_eq!(fsm.state(), State::Lockout);

        fsm.lockout_timer.advance(31.0);
        run_ticks(&mut fsm, &mut events, 1);
        assert_eq!(fsm.state(), State::Waiting);
    }

    #[test]
    fn matcher_error_skips_the_tick_without_transition() {
        let matcher = ScriptMatcher::new(DirectionPolicy::Plurality).probes(&[true]);
        let (mut fsm, counts) = build(base_cfg(), matcher, vec![]);
        let mut events = Recorder::default();

        run_ticks(&mut fsm, &mut events, 1);
        assert_eq!(fsm.state(), State::Matching);

        // The script is exhausted: match_frame errors, the state holds.
        assert!(fsm.tick(&frame(), &mut events).is_err());
        assert_eq!(fsm.state(), State::Matching);
        assert_eq!(fsm.group.len(), 0);
        assert_eq!(counts.locks() + counts.unlocks(), 0);
    }

    #[test]
    fn lockout_dummy_skips_the_actuator() {
        let matcher = ScriptMatcher::new(DirectionPolicy::Plurality)
            .verdicts(&failing_cycle())
            .probes(&[true]);
        let cfg = FsmConfig { lockout_dummy: true, ..base_cfg() };
        let (mut fsm, counts) = build(cfg, matcher, vec![]);
        let mut events = Recorder::default();

        run_ticks(&mut fsm, &mut events, 5);
        assert_eq!(fsm.state(), State::Lockout, "state flow is unchanged");
        assert_eq!(counts.locks(), 0, "dummy mode must not drive the door");
    }

    #[test]
    fn images_are_saved_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let matcher = passing_matcher();
        let cfg = FsmConfig {
            saveimg: true,
            output_path: dir.path().to_string_lossy().into_owned(),
            ..base_cfg()
        };
        let (mut fsm, _counts) = build(cfg, matcher, vec![]);
        let mut events = Recorder::default();

        run_ticks(&mut fsm, &mut events, 5);

        let pngs: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(pngs.len(), 4, "one image per group member: {:?}", pngs);
        assert!(pngs.iter().all(|p| p.starts_with("match_") && p.ends_with(".png")));

        assert_eq!(events.count("save_img"), 4);
        assert_eq!(events.count("save_imgs"), 1);
        assert!(fsm.group.matches().iter().all(|m| m.img.is_none()), "images released");
    }
}
