extern crate log;
pub mod crs;
pub mod geofile;
pub mod merge;
use crate::crs::crs_utils::{Crs, EpsgCode};
use crate::geofile::gdal_geofile::GdalDriverType;
use crate::merge::merger::{merge_state_shapefiles, CrsPolicy, MergeParams};
use anyhow::anyhow;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::{fs::read_to_string, path::Path};

/// Merge per-state census tract shapefiles into a single national dataset.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input config file. Defaults are used when omitted.
    #[arg(short, long)]
    config_filepath: Option<String>,
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(default)]
struct Config {
    input_dir: PathBuf,
    output_path: PathBuf,
    target_epsg: EpsgCode,
    output_driver: GdalDriverType,
    crs_policy: CrsPolicy,
    max_features: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("2014-tracts-by-state"),
            output_path: PathBuf::from("us_tracts_2014"),
            target_epsg: 4326,
            output_driver: GdalDriverType::Shapefile,
            crs_policy: CrsPolicy::ReprojectEach,
            max_features: None,
        }
    }
}

impl From<Config> for MergeParams {
    fn from(config: Config) -> Self {
        Self {
            input_dir: config.input_dir,
            output_path: config.output_path,
            target_crs: Crs::from_epsg(config.target_epsg),
            output_driver: config.output_driver,
            crs_policy: config.crs_policy,
            max_features: config.max_features,
        }
    }
}

fn load_config(config_filepath: Option<&str>) -> anyhow::Result<Config> {
    match config_filepath {
        Some(config_filepath) => {
            if !Path::new(config_filepath).exists() {
                return Err(anyhow!("Config file {} not found", config_filepath));
            }
            let config_contents = read_to_string(config_filepath)?;
            Ok(serde_yaml::from_str(&config_contents)?)
        }
        None => Ok(Config::default()),
    }
}

fn try_main() -> anyhow::Result<()> {
    let args = Args::try_parse()?;
    let config = load_config(args.config_filepath.as_deref())?;
    log::debug!("{:?}", config);

    let report = merge_state_shapefiles(&config.into())?;
    log::info!("Merged {} states", report.state_count);
    println!("created shapefile with {} rows", report.row_count);
    println!("finished in {:.1} seconds", report.elapsed.as_secs_f64());
    Ok(())
}

fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    env_logger::init();
    if let Err(e) = try_main() {
        eprintln!("Error: {:?}", e);
        std::process::exit(1)
    }
}
