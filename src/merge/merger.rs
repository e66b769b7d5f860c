use indicatif::{ParallelProgressIterator, ProgressBar};
use rayon::prelude::*;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use super::error::MergeError;
use crate::{
    crs::{crs_utils::Crs, reprojection::reproject_collection},
    geofile::{
        feature::FeatureCollection,
        gdal_geofile::{read_features_from_geofile, write_features_to_geofile, GdalDriverType},
    },
};

/// How differing input CRS are dealt with.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrsPolicy {
    /// Reproject every state to the target CRS before concatenation.
    #[default]
    ReprojectEach,
    /// Require all states to share the CRS of the last loaded state, reproject once after
    /// concatenation.
    RequireUniform,
}

#[derive(Debug, Clone)]
pub struct MergeParams {
    pub input_dir: PathBuf,
    pub output_path: PathBuf,
    pub target_crs: Crs,
    pub output_driver: GdalDriverType,
    pub crs_policy: CrsPolicy,
    pub max_features: Option<usize>,
}

#[derive(Debug)]
pub struct MergeReport {
    pub row_count: usize,
    pub state_count: usize,
    pub elapsed: Duration,
}

/// Merge all per-state datasets below `params.input_dir` into one dataset at `params.output_path`.
pub fn merge_state_shapefiles(params: &MergeParams) -> Result<MergeReport, MergeError> {
    let start_time = Instant::now();

    let state_dirs = list_state_directories(&params.input_dir)?;
    log::info!("Found {} state directories", state_dirs.len());
    let collections =
        load_state_collections(&state_dirs, params.crs_policy, &params.target_crs)?;
    let mut merged =
        merge_collections(collections, &state_dirs, params.crs_policy, &params.target_crs)?;
    log::info!("Merged {} features", merged.len());

    if let Some(max_features) = params.max_features {
        if merged.len() > max_features {
            log::warn!(
                "Keeping only the first {} of {} features",
                max_features,
                merged.len()
            );
            merged.truncate(max_features);
        }
    }

    log::info!("Projecting merged features to {}", params.target_crs);
    let merged = reproject_collection(merged, &params.target_crs)
        .map_err(|err| MergeError::Projection(format!("{:#}", err)))?;

    write_output(&merged, &params.output_path, params.output_driver)?;

    Ok(MergeReport {
        row_count: merged.len(),
        state_count: state_dirs.len(),
        elapsed: start_time.elapsed(),
    })
}

/// Immediate subdirectories of `input_dir`, sorted by name.
pub fn list_state_directories(input_dir: &Path) -> Result<Vec<PathBuf>, MergeError> {
    if !input_dir.is_dir() {
        return Err(MergeError::NotFound {
            path: input_dir.to_path_buf(),
        });
    }
    let entries = fs::read_dir(input_dir).map_err(|err| MergeError::Read {
        path: input_dir.to_path_buf(),
        reason: err.to_string(),
    })?;
    let mut state_dirs = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|err| MergeError::Read {
                path: input_dir.to_path_buf(),
                reason: err.to_string(),
            })?
            .path();
        if path.is_dir() {
            state_dirs.push(path);
        } else {
            log::warn!("Skipping {:?}, not a directory", path);
        }
    }
    if state_dirs.is_empty() {
        return Err(MergeError::EmptyInput {
            path: input_dir.to_path_buf(),
        });
    }
    state_dirs.sort();
    Ok(state_dirs)
}

/// Read every state directory in parallel, keeping the order of `state_dirs`.
///
/// GDAL datasets and PROJ transformations live only on the worker thread reading the state.
/// State names and counts are logged from the calling thread, outside the progress bar.
pub fn load_state_collections(
    state_dirs: &[PathBuf],
    crs_policy: CrsPolicy,
    target_crs: &Crs,
) -> Result<Vec<FeatureCollection>, MergeError> {
    for state_dir in state_dirs {
        log::info!("{}", state_name(state_dir));
    }
    let bar = ProgressBar::new(state_dirs.len() as u64);
    let collections = state_dirs
        .par_iter()
        .progress_with(bar.clone())
        .map(|state_dir| load_state_collection(state_dir, crs_policy, target_crs))
        .collect::<Result<Vec<FeatureCollection>, MergeError>>();
    bar.finish_and_clear();
    let collections = collections?;
    for (state_dir, collection) in state_dirs.iter().zip(&collections) {
        log::info!(
            "Read {} features from {}",
            collection.len(),
            state_name(state_dir)
        );
    }
    Ok(collections)
}

fn state_name(state_dir: &Path) -> String {
    state_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn load_state_collection(
    state_dir: &Path,
    crs_policy: CrsPolicy,
    target_crs: &Crs,
) -> Result<FeatureCollection, MergeError> {
    let collection = read_features_from_geofile(state_dir).map_err(|err| MergeError::Read {
        path: state_dir.to_path_buf(),
        reason: format!("{:#}", err),
    })?;
    match crs_policy {
        CrsPolicy::ReprojectEach => reproject_collection(collection, target_crs).map_err(|err| {
            MergeError::Projection(format!("{:?}: {:#}", state_dir, err))
        }),
        CrsPolicy::RequireUniform => Ok(collection),
    }
}

/// Concatenate loaded states into one collection and decide its CRS.
pub fn merge_collections(
    collections: Vec<FeatureCollection>,
    state_dirs: &[PathBuf],
    crs_policy: CrsPolicy,
    target_crs: &Crs,
) -> Result<FeatureCollection, MergeError> {
    let crs = match crs_policy {
        CrsPolicy::ReprojectEach => target_crs.clone(),
        CrsPolicy::RequireUniform => {
            let last_crs = match collections.last() {
                Some(collection) => collection.crs.clone(),
                None => target_crs.clone(),
            };
            for (collection, state_dir) in collections.iter().zip(state_dirs) {
                let same_crs = collection
                    .crs
                    .is_equivalent(&last_crs)
                    .map_err(|err| MergeError::Projection(format!("{:?}: {:#}", state_dir, err)))?;
                if !same_crs {
                    return Err(MergeError::Projection(format!(
                        "{:?} is in {}, expected {}",
                        state_dir, collection.crs, last_crs
                    )));
                }
            }
            last_crs
        }
    };
    Ok(FeatureCollection::concat(collections, crs))
}

/// Write to a staging location next to `output_path` and move the result into place only once
/// writing succeeded.
fn write_output(
    collection: &FeatureCollection,
    output_path: &Path,
    driver: GdalDriverType,
) -> Result<(), MergeError> {
    let write_error = |reason: String| MergeError::Write {
        path: output_path.to_path_buf(),
        reason,
    };
    let file_name = output_path
        .file_name()
        .ok_or_else(|| write_error("Output path has no file name".to_string()))?;
    let layer_name = output_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string_lossy().into_owned());
    let parent = match output_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let staging_dir = parent.join(format!(".{}.partial", file_name.to_string_lossy()));
    let staged_output = staging_dir.join(file_name);

    if output_path.is_dir() {
        check_only_layer_files(output_path, &layer_name).map_err(write_error)?;
    }
    if staging_dir.exists() {
        fs::remove_dir_all(&staging_dir).map_err(|err| write_error(err.to_string()))?;
    }
    fs::create_dir_all(&staging_dir).map_err(|err| write_error(err.to_string()))?;

    let result = write_features_to_geofile(collection, &staged_output, &layer_name, driver)
        .map_err(|err| write_error(format!("{:#}", err)))
        .and_then(|()| {
            replace_output(&staged_output, output_path, &staging_dir)
                .map_err(write_error)
        });

    if let Err(err) = fs::remove_dir_all(&staging_dir) {
        log::warn!("Could not remove staging directory {:?}: {}", staging_dir, err);
    }
    if result.is_ok() {
        log::info!("Wrote {} features to {:?}", collection.len(), output_path);
    }
    result
}

/// Move `staged_output` to `output_path`.
///
/// An existing output is moved into `staging_dir` first and restored if the move fails.
fn replace_output(
    staged_output: &Path,
    output_path: &Path,
    staging_dir: &Path,
) -> Result<(), String> {
    if !output_path.exists() {
        return fs::rename(staged_output, output_path).map_err(|err| err.to_string());
    }
    let previous_output = staging_dir.join("previous");
    fs::rename(output_path, &previous_output)
        .map_err(|err| format!("Could not move existing output aside: {}", err))?;
    if let Err(err) = fs::rename(staged_output, output_path) {
        if let Err(restore_err) = fs::rename(&previous_output, output_path) {
            log::error!(
                "Could not restore previous output {:?}: {}",
                output_path,
                restore_err
            );
        }
        return Err(err.to_string());
    }
    Ok(())
}

/// An existing output directory is only replaced when it holds nothing but `<layer_name>.*` files.
fn check_only_layer_files(output_dir: &Path, layer_name: &str) -> Result<(), String> {
    let entries = fs::read_dir(output_dir).map_err(|err| err.to_string())?;
    for entry in entries {
        let path = entry.map_err(|err| err.to_string())?.path();
        let is_layer_file =
            path.is_file() && path.file_stem().map_or(false, |stem| stem == layer_name);
        if !is_layer_file {
            return Err(format!(
                "Refusing to replace {:?}, it contains {:?} which is not part of layer {}",
                output_dir, path, layer_name
            ));
        }
    }
    Ok(())
}
