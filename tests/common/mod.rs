//! Shared fixtures: scenario directories materialized under a temp dir.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU32, Ordering};

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// A scenario directory on disk, removed again on drop.
pub struct ScenarioDir {
    path: PathBuf,
}

impl ScenarioDir {
    /// Creates a directory holding `updates.csv` and, if given, `config.toml`.
    pub fn new(name: &str, config_toml: Option<&str>, updates_csv: &str) -> Self {
        let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "meter-sim-test-{}-{}-{unique}",
            process::id(),
            name
        ));
        fs::create_dir_all(&path).expect("fixture dir should be creatable");

        if let Some(config) = config_toml {
            fs::write(path.join("config.toml"), config).expect("config.toml should be writable");
        }
        fs::write(path.join("updates.csv"), updates_csv).expect("updates.csv should be writable");

        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScenarioDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 220 V / 50 A / 0 deg on all phases from t = 0: 11 kW per phase.
pub const SIMPLE_UPDATES: &str = "0,0,50.0,220,220,220,50,50,50,0,0,0,0,0,0,0,0,0\n";

/// Five tariffs at 100x speed-up with seeded export registers
/// (66 Ws active, 40 + 48 vars reactive, so the apparent seed is 110 VAs).
pub const TARIFF_SWITCH_CONFIG: &str = r#"
serialNumber = "METER-0042"
speedup = 100
tariffCount = 5
meterConstant = 3600
startTimestamp = 2023-01-01T00:00:00Z

[[tariff]]
[tariff.phase1]
activeMinus = 66
reactive2 = 40
reactive3 = 48
"#;

/// Tariff switches to 4 at t = 10; the last update at t = 190 raises phase-1
/// voltage to 300 V and the ui angle to 110 deg.
pub const TARIFF_SWITCH_UPDATES: &str = "\
0,0,50.0,220,220,220,50,50,50,0,0,0,0.01,0.01,0.01,0.02,0.02,0.02\n\
10,4,50.0,220,220,220,50,50,50,0,0,0,0.01,0.01,0.01,0.02,0.02,0.02\n\
190,4,50.0,300,220,220,50,50,50,110,0,0,0.01,0.01,0.01,0.02,0.02,0.02\n";

/// Builds the five-tariff switching scenario.
pub fn tariff_switch_scenario(name: &str) -> ScenarioDir {
    ScenarioDir::new(name, Some(TARIFF_SWITCH_CONFIG), TARIFF_SWITCH_UPDATES)
}
