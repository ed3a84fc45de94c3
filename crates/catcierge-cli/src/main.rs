use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use catcierge_events::{Output, VAR_DOCS};
use catcierge_fsm::{CsvLog, Fsm, FsmConfig, LockoutMethod, MatchGroup, State, TemplateCtx};
use catcierge_gpio::{Actuator, DummyActuator, GpioConfig, SysfsActuator};
use catcierge_rfid::{spawn_reader, ReaderSide, TagRead};
use catcierge_vision::camera::{CameraConfig, FrameSource};
use catcierge_vision::haar::{parse_min_size, HaarConfig, HaarMatcher};
use catcierge_vision::template::{TemplateConfig, TemplateMatcher};
use catcierge_vision::Matcher;

#[derive(Debug, Parser)]
#[command(name = "catcierge", version, about = "Image-recognizing cat door supervisor")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch the door and drive the lock.
    Run,
    /// Validate the configuration without touching hardware.
    Doctor,
    /// List the output template variables.
    Vars,
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    matcher: MatcherCfg,
    door: DoorCfg,
    output: OutputCfg,
    camera: CameraConfig,

    template: Option<TemplateConfig>,
    haar: Option<HaarConfig>,
    rfid: Option<RfidCfg>,
    gpio: Option<GpioConfig>,
    events: Option<EventsCfg>,
}

#[derive(Debug, serde::Deserialize)]
struct MatcherCfg {
    /// "template" or "haar"
    #[serde(rename = "type")]
    kind: String,
}

fn default_match_time() -> f64 {
    30.0
}

fn default_lockout_time() -> f64 {
    30.0
}

fn default_lockout_method() -> LockoutMethod {
    LockoutMethod::ObstructOrTimer
}

fn default_lockout_delay() -> f64 {
    3.0
}

fn default_ok_matches() -> u32 {
    2
}

#[derive(Debug, serde::Deserialize)]
struct DoorCfg {
    #[serde(default = "default_match_time")]
    match_time: f64,

    #[serde(default = "default_lockout_time")]
    lockout_time: f64,

    #[serde(default = "default_lockout_method")]
    lockout_method: LockoutMethod,

    /// 0 disables the consecutive-lockout watchdog.
    #[serde(default)]
    max_consecutive_lockout_count: u32,

    #[serde(default = "default_lockout_delay")]
    consecutive_lockout_delay: f64,

    #[serde(default = "default_ok_matches")]
    ok_matches_needed: u32,

    #[serde(default)]
    lockout_dummy: bool,

    #[serde(default)]
    show: bool,

    /// Numeric "uid:gid" to drop to after GPIO export.
    chuid: Option<String>,
}

fn default_output_path() -> String {
    ".".into()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, serde::Deserialize)]
struct OutputCfg {
    #[serde(default = "default_true")]
    saveimg: bool,

    #[serde(default)]
    save_steps: bool,

    #[serde(default)]
    highlight_match: bool,

    #[serde(default = "default_output_path")]
    output_path: String,

    /// CSV match log; omitted means no log.
    log_path: Option<String>,
}

fn default_rfid_lock_time() -> f64 {
    2.0
}

#[derive(Debug, serde::Deserialize)]
struct RfidCfg {
    inner_path: Option<String>,
    outer_path: Option<String>,

    #[serde(default)]
    allowed: Vec<String>,

    #[serde(default = "default_rfid_lock_time")]
    lock_time: f64,

    #[serde(default)]
    lock_on_invalid: bool,
}

#[derive(Debug, serde::Deserialize)]
struct EventsCfg {
    #[serde(default = "default_true")]
    new_execute: bool,

    #[serde(default)]
    templates: Vec<String>,

    match_cmd: Option<String>,
    match_done_cmd: Option<String>,
    save_img_cmd: Option<String>,
    save_imgs_cmd: Option<String>,
    rfid_detect_cmd: Option<String>,
    rfid_match_cmd: Option<String>,
    do_lockout_cmd: Option<String>,
    do_unlock_cmd: Option<String>,
    state_change_cmd: Option<String>,
}

impl EventsCfg {
    fn commands(&self) -> Vec<(&'static str, &Option<String>)> {
        vec![
            ("match", &self.match_cmd),
            ("match_done", &self.match_done_cmd),
            ("save_img", &self.save_img_cmd),
            ("save_imgs", &self.save_imgs_cmd),
            ("rfid_detect", &self.rfid_detect_cmd),
            ("rfid_match", &self.rfid_match_cmd),
            ("do_lockout", &self.do_lockout_cmd),
            ("do_unlock", &self.do_unlock_cmd),
            ("state_change", &self.state_change_cmd),
        ]
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Run => run(&load_config(&cli.config)?).await,
        Command::Doctor => doctor(&load_config(&cli.config)?),
        Command::Vars => {
            vars();
            Ok(())
        }
    }
}

fn vars() {
    println!("Output template variables:");
    for (name, desc) in VAR_DOCS {
        println!("{:>24}   {}", name, desc);
    }
}

fn fsm_config(cfg: &Config) -> FsmConfig {
    let rfid = cfg.rfid.as_ref();
    FsmConfig {
        match_time: cfg.door.match_time,
        lockout_time: cfg.door.lockout_time,
        lockout_method: cfg.door.lockout_method,
        max_consecutive_lockout_count: cfg.door.max_consecutive_lockout_count,
        consecutive_lockout_delay: cfg.door.consecutive_lockout_delay,
        ok_matches_needed: cfg.door.ok_matches_needed,
        saveimg: cfg.output.saveimg,
        save_steps: cfg.output.save_steps,
        highlight_match: cfg.output.highlight_match,
        output_path: cfg.output.output_path.clone(),
        lockout_dummy: cfg.door.lockout_dummy,
        rfid_inner_configured: rfid.is_some_and(|r| r.inner_path.is_some()),
        rfid_outer_configured: rfid.is_some_and(|r| r.outer_path.is_some()),
        rfid_lock_time: rfid.map(|r| r.lock_time).unwrap_or_else(default_rfid_lock_time),
        lock_on_invalid_rfid: rfid.is_some_and(|r| r.lock_on_invalid),
    }
}

fn init_matcher(cfg: &Config) -> Result<Box<dyn Matcher>> {
    match cfg.matcher.kind.as_str() {
        "template" => {
            let t = cfg.template.as_ref().context("[template] section missing")?;
            Ok(Box::new(TemplateMatcher::new(t.clone())?))
        }
        "haar" => {
            let h = cfg.haar.as_ref().context("[haar] section missing")?;
            Ok(Box::new(HaarMatcher::new(h.clone())?))
        }
        other => anyhow::bail!("unknown matcher.type: {}", other),
    }
}

fn init_actuator(cfg: &Config) -> Result<Box<dyn Actuator>> {
    match &cfg.gpio {
        Some(g) => Ok(Box::new(SysfsActuator::new(g)?)),
        None => {
            warn!("no [gpio] section, using a dummy actuator");
            Ok(Box::new(DummyActuator::default()))
        }
    }
}

fn init_output(cfg: &Config) -> Result<Output> {
    let events = cfg.events.as_ref();
    let new_execute = events.map(|e| e.new_execute).unwrap_or(true);
    let mut output = Output::new(&cfg.output.output_path, new_execute);

    if let Some(e) = events {
        for (name, cmd) in e.commands() {
            if let Some(cmd) = cmd {
                output.set_command(name, cmd);
            }
        }
        for path in &e.templates {
            output.load_template_file(path)?;
        }
    }

    Ok(output)
}

/// Drop root after GPIO export. `chuid` is numeric "uid:gid".
fn drop_privileges(chuid: &str) -> Result<()> {
    let (uid, gid) = chuid.split_once(':').context("chuid must be \"uid:gid\"")?;
    let uid: u32 = uid.parse().context("chuid uid")?;
    let gid: u32 = gid.parse().context("chuid gid")?;

    // Safety: bare setgid/setuid syscalls on our own process.
    unsafe {
        if libc::geteuid() != 0 {
            info!("not running as root, no privileges to drop");
            return Ok(());
        }
        anyhow::ensure!(libc::setgid(gid) == 0, "setgid({}) failed", gid);
        anyhow::ensure!(libc::setuid(uid) == 0, "setuid({}) failed", uid);
    }

    info!("root privileges dropped to {}:{}", uid, gid);
    Ok(())
}

async fn run(cfg: &Config) -> Result<()> {
    info!("run: starting");

    let matcher = init_matcher(cfg)?;
    let matcher_kind = matcher.kind();
    let actuator = init_actuator(cfg)?;
    let csv = CsvLog::open(cfg.output.log_path.as_deref())?;
    let mut output = init_output(cfg)?;
    let mut camera = FrameSource::new(&cfg.camera)?;

    if cfg.door.show {
        warn!("door.show is set but this build has no preview window");
    }

    let allowed = cfg.rfid.as_ref().map(|r| r.allowed.clone()).unwrap_or_default();
    let fsm_cfg = fsm_config(cfg);

    // Surface broken templates before the first event fires.
    {
        let group = MatchGroup::new();
        let ctx = TemplateCtx {
            state: State::Waiting,
            prev_state: State::Waiting,
            cfg: &fsm_cfg,
            matcher_kind,
            group: &group,
            now: chrono_now(),
        };
        if let Err(e) = output.validate(&ctx) {
            warn!("output template validation: {:#}", e);
        }
    }

    let mut fsm = Fsm::new(fsm_cfg, matcher, actuator, csv, allowed);

    // RFID readers push framed tags onto the main loop.
    let (rfid_tx, mut rfid_rx) = mpsc::channel::<TagRead>(32);
    let mut reader_handles = Vec::new();
    if let Some(r) = &cfg.rfid {
        if let Some(path) = &r.inner_path {
            reader_handles.push(spawn_reader(ReaderSide::Inner, path, rfid_tx.clone())?);
        }
        if let Some(path) = &r.outer_path {
            reader_handles.push(spawn_reader(ReaderSide::Outer, path, rfid_tx.clone())?);
        }
        if !reader_handles.is_empty() {
            info!("initialized {} RFID reader(s)", reader_handles.len());
        }
    }
    drop(rfid_tx);

    if let Some(chuid) = &cfg.door.chuid {
        drop_privileges(chuid)?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, draining current tick");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    while fsm.running() && !shutdown.load(Ordering::SeqCst) {
        // RFID callbacks marshal onto this thread between ticks.
        while let Ok(read) = rfid_rx.try_recv() {
            fsm.handle_rfid(&read, &mut output);
        }

        let frame = match camera.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("frame stream ended");
                break;
            }
            Err(e) => {
                tracing::error!("camera failed: {:#}", e);
                break;
            }
        };

        if let Err(e) = fsm.tick(&frame, &mut output) {
            warn!("frame skipped: {:#}", e);
        }
    }

    fsm.final_unlock(&mut output);
    for h in reader_handles {
        h.abort();
    }
    info!("run: done");
    Ok(())
}

fn chrono_now() -> chrono::DateTime<chrono::Local> {
    chrono::Local::now()
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    // Matcher resources must load.
    match cfg.matcher.kind.as_str() {
        "template" => {
            let t = cfg.template.as_ref().context("[template] section missing")?;
            anyhow::ensure!(!t.snout_paths.is_empty(), "template.snout_paths is empty");
            let m = TemplateMatcher::new(t.clone())?;
            info!("doctor: {} snout template(s) loaded", m.snout_count());
            anyhow::ensure!(
                t.match_threshold > 0.0 && t.match_threshold <= 1.0,
                "template.match_threshold must be in (0, 1]"
            );
        }
        "haar" => {
            let h = cfg.haar.as_ref().context("[haar] section missing")?;
            parse_min_size(&h.min_size).context("haar.min_size")?;
            HaarMatcher::new(h.clone())?;
            info!("doctor: cascade model loaded");
        }
        other => anyhow::bail!("unknown matcher.type: {}", other),
    }

    // Output templates and commands must render.
    let output = init_output(cfg)?;
    let fsm_cfg = fsm_config(cfg);
    let group = MatchGroup::new();
    let ctx = TemplateCtx {
        state: State::Waiting,
        prev_state: State::Waiting,
        cfg: &fsm_cfg,
        matcher_kind: cfg.matcher.kind.as_str(),
        group: &group,
        now: chrono_now(),
    };
    output.validate(&ctx).context("output templates")?;
    info!("doctor: {} output template(s) ok", output.template_count());

    if let Some(g) = &cfg.gpio {
        anyhow::ensure!(g.door_pin != g.backlight_pin, "gpio pins must differ");
    }

    if let Some(r) = &cfg.rfid {
        anyhow::ensure!(
            r.allowed.iter().all(|t| !t.trim().is_empty()),
            "rfid.allowed contains an empty tag"
        );
        if r.lock_on_invalid && r.inner_path.is_none() && r.outer_path.is_none() {
            anyhow::bail!("rfid.lock_on_invalid set but no reader configured");
        }
    }

    if let Some(chuid) = &cfg.door.chuid {
        anyhow::ensure!(chuid.split_once(':').is_some(), "door.chuid must be \"uid:gid\"");
    }

    if cfg.door.max_consecutive_lockout_count > 0
        && cfg.door.lockout_time + cfg.door.consecutive_lockout_delay <= 0.0
    {
        warn!("doctor: watchdog enabled with a zero-width window, every lockout will count");
    }

    info!("doctor: OK");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [matcher]
        type = "haar"

        [door]
        match_time = 20
        lockout_time = 45
        lockout_method = 2
        max_consecutive_lockout_count = 3
        consecutive_lockout_delay = 5
        ok_matches_needed = 3
        chuid = "1000:1000"

        [output]
        saveimg = true
        save_steps = true
        output_path = "/var/lib/catcierge"
        log_path = "/var/log/catcierge.csv"

        [camera]
        mode = "v4l2-mjpeg"
        device = "/dev/video1"
        width = 320
        height = 240

        [haar]
        cascade = "/etc/catcierge/catcierge.json"
        min_size = "80x80"
        eq_histogram = true
        prey_method = "adaptive"
        in_direction = "left"

        [rfid]
        inner_path = "/dev/ttyUSB0"
        outer_path = "/dev/ttyUSB1"
        allowed = ["999_000000001007"]
        lock_time = 2.5
        lock_on_invalid = true

        [gpio]
        door_pin = 4
        backlight_pin = 11

        [events]
        new_execute = true
        templates = ["/etc/catcierge/event.json"]
        match_done_cmd = "notify-send 'match %match_success%'"
    "#;

    #[test]
    fn full_config_parses() {
        let cfg: Config = toml::from_str(FULL).unwrap();
        assert_eq!(cfg.matcher.kind, "haar");
        assert_eq!(cfg.door.lockout_method, LockoutMethod::ObstructThenTimer);
        assert_eq!(cfg.door.match_time, 20.0);
        assert_eq!(cfg.output.log_path.as_deref(), Some("/var/log/catcierge.csv"));
        assert_eq!(cfg.camera.device, "/dev/video1");
        let rfid = cfg.rfid.unwrap();
        assert!(rfid.lock_on_invalid);
        assert_eq!(rfid.allowed.len(), 1);
        assert_eq!(cfg.events.unwrap().templates.len(), 1);
    }

    #[test]
    fn fsm_config_reflects_sections() {
        let cfg: Config = toml::from_str(FULL).unwrap();
        let f = fsm_config(&cfg);
        assert_eq!(f.lockout_time, 45.0);
        assert_eq!(f.ok_matches_needed, 3);
        assert!(f.rfid_inner_configured);
        assert!(f.rfid_outer_configured);
        assert!(f.lock_on_invalid_rfid);
        assert_eq!(f.rfid_lock_time, 2.5);
        assert!(f.saveimg);
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [matcher]
            type = "template"

            [door]

            [output]

            [camera]
            mode = "dir"
            frame_dir = "/tmp/frames"

            [template]
            snout_paths = ["snout.png"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.door.match_time, 30.0);
        assert_eq!(cfg.door.lockout_method, LockoutMethod::ObstructOrTimer);
        assert_eq!(cfg.door.ok_matches_needed, 2);
        assert!(cfg.output.saveimg);
        assert_eq!(cfg.output.output_path, ".");
        let f = fsm_config(&cfg);
        assert!(!f.rfid_inner_configured);
        assert!(!f.lock_on_invalid_rfid);
    }

    #[test]
    fn bad_lockout_method_is_rejected() {
        let err = toml::from_str::<Config>(
            r#"
            [matcher]
            type = "template"

            [door]
            lockout_method = 7

            [output]

            [camera]
            mode = "dir"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("lockout_method"));
    }
}
