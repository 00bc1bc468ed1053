//! Battery metrics through `upower`.
pub mod parse;

use crate::command::{CommandRunner, ExternalCommand};
use crate::model::{BatteryRecord, Domain};
use crate::scan::{run_checked, ScanError, Scanner};
use derivative::Derivative;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Program driving this domain.
pub const UPOWER: &str = "upower";

/// Reads every battery upower knows of.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct BatteryScanner {
    #[derivative(Debug = "ignore")]
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl BatteryScanner {
    #[allow(missing_docs)]
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

impl Scanner for BatteryScanner {
    type Record = BatteryRecord;

    fn domain(&self) -> Domain {
        Domain::Battery
    }

    fn scan(&self) -> Result<Vec<BatteryRecord>, ScanError> {
        let list = ExternalCommand::new(UPOWER).arg("-e").timeout(self.timeout);
        let out = run_checked(&*self.runner, &list)?;
        let mut res = Vec::new();
        for path in parse::parse_battery_paths(&out.stdout) {
            let info = ExternalCommand::new(UPOWER)
                .args(["-i", path.as_str()])
                .timeout(self.timeout);
            match run_checked(&*self.runner, &info) {
                Ok(info) => res.push(parse::parse_battery_info(&path, &info.stdout)),
                Err(e) => debug!("Skipping battery {}: {}", path, e),
            }
        }
        Ok(res)
    }
}
