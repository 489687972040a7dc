use hoard_config::{HoardConfig, validate};
use hoard_core::master::Master;
use tracing::{error, warn};
use utils::init_tracing;

const CONFIG_FILE: &str = "hoard.conf";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = HoardConfig::from_file_or_default(CONFIG_FILE);
    init_tracing(cfg.global().log_level());

    let report = validate(&cfg);
    for warning in report.warnings() {
        warn!(target: "hoard::config", "{warning}");
    }
    if report.has_errors() {
        for err in report.errors() {
            error!(target: "hoard::config", "{err}");
        }
        anyhow::bail!("invalid configuration in {CONFIG_FILE}:\n{}", report.format());
    }
    cfg.print();

    Master::new(cfg).run().await
}
