//! Door lock actuation. The door solenoid and the IR backlight hang off two
//! GPIO pins driven through the sysfs interface; the backlight stays on in
//! both positions so the camera always sees a lit silhouette.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};

fn default_door_pin() -> u32 {
    4
}

fn default_backlight_pin() -> u32 {
    11
}

fn default_gpio_root() -> String {
    "/sys/class/gpio".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpioConfig {
    #[serde(default = "default_door_pin")]
    pub door_pin: u32,

    #[serde(default = "default_backlight_pin")]
    pub backlight_pin: u32,

    /// Overridable for tests; the kernel interface lives at /sys/class/gpio.
    #[serde(default = "default_gpio_root")]
    pub root: String,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            door_pin: default_door_pin(),
            backlight_pin: default_backlight_pin(),
            root: default_gpio_root(),
        }
    }
}

/// The process-wide lock capability. The decision engine drives this; leaf
/// components never touch pins directly.
pub trait Actuator: Send {
    fn lock(&mut self) -> Result<()>;
    fn unlock(&mut self) -> Result<()>;
}

struct Pin {
    number: u32,
    root: PathBuf,
}

impl Pin {
    fn export(root: &str, number: u32) -> Result<Self> {
        let root = PathBuf::from(root);
        let pin = Self { number, root };

        if !pin.dir().exists() {
            write_sys(&pin.root.join("export"), &number.to_string())
                .with_context(|| format!("export gpio {}", number))?;
        }
        write_sys(&pin.dir().join("direction"), "out")
            .with_context(|| format!("set gpio {} direction", number))?;

        debug!("gpio: exported pin {}", number);
        Ok(pin)
    }

    fn dir(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.number))
    }

    fn write(&self, value: u8) -> Result<()> {
        write_sys(&self.dir().join("value"), if value == 0 { "0" } else { "1" })
            .with_context(|| format!("write gpio {}", self.number))
    }

    fn unexport(&self) {
        if let Err(e) = write_sys(&self.root.join("unexport"), &self.number.to_string()) {
            warn!("gpio: unexport pin {} failed: {:#}", self.number, e);
        }
    }
}

fn write_sys(path: &std::path::Path, value: &str) -> Result<()> {
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    f.write_all(value.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Sysfs-backed actuator. Door pin high = locked; backlight held high in
/// both positions. Pins are unexported when the actuator drops, on every
/// exit path.
pub struct SysfsActuator {
    door: Pin,
    backlight: Pin,
}

impl SysfsActuator {
    pub fn new(cfg: &GpioConfig) -> Result<Self> {
        let door = Pin::export(&cfg.root, cfg.door_pin)?;
        let backlight = Pin::export(&cfg.root, cfg.backlight_pin)?;

        // Boot with the door open and the light on.
        door.write(0)?;
        backlight.write(1)?;

        info!(
            "gpio: door on pin {}, backlight on pin {}",
            cfg.door_pin, cfg.backlight_pin
        );
        Ok(Self { door, backlight })
    }
}

impl Actuator for SysfsActuator {
    fn lock(&mut self) -> Result<()> {
        self.door.write(1)?;
        self.backlight.write(1)?;
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        self.door.write(0)?;
        self.backlight.write(1)?;
        Ok(())
    }
}

impl Drop for SysfsActuator {
    fn drop(&mut self) {
        self.door.unexport();
        self.backlight.unexport();
    }
}

/// No-hardware stand-in for integration runs without an actuator.
#[derive(Debug, Default)]
pub struct DummyActuator {
    pub locks: u32,
    pub unlocks: u32,
}

impl Actuator for DummyActuator {
    fn lock(&mut self) -> Result<()> {
        self.locks += 1;
        info!("actuator: lock (dummy)");
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        self.unlocks += 1;
        info!("actuator: unlock (dummy)");
        Ok(())
    }
}
