//! `fle-keygen`: create a data key wrapped with the local master key and
//! print its key vault document as relaxed extended JSON.
//!
//! Usage: `fle-keygen [ALT_NAME]...`
//!
//! Startup sequence:
//! 1. Load and validate [`DriverConfig`] from environment variables.
//! 2. Initialise tracing.
//! 3. Build the [`Crypt`] engine and generate the key.

use anyhow::{Context, Result};
use bson::Bson;
use fle_crypt::Crypt;
use fle_driver::{telemetry, DriverConfig};
use tracing::info;

fn main() -> Result<()> {
    let cfg = DriverConfig::from_env().map_err(|e| {
        // Tracing is not up yet.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    telemetry::init_telemetry(&cfg.log_level)?;
    info!(version = fle_crypt::version(), "fle-keygen starting");

    let crypt = Crypt::new(cfg.crypt_config()?).context("failed to initialise crypt engine")?;

    let alt_names: Vec<String> = std::env::args().skip(1).collect();
    let alt_names: Vec<&str> = alt_names.iter().map(String::as_str).collect();
    let key_doc = crypt
        .generate_local_data_key(&alt_names)
        .context("failed to generate data key")?;

    let json = serde_json::to_string_pretty(&Bson::Document(key_doc).into_relaxed_extjson())
        .context("failed to render key document")?;
    println!("{json}");
    Ok(())
}
