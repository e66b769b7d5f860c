use anyhow::anyhow;
use proj::Transform;

use super::crs_utils::Crs;
use crate::geofile::feature::{Feature, FeatureCollection};

/// Reproject all geometries of `collection` to `to_crs`.
///
/// A collection already in an equivalent CRS is returned as is, so reprojecting twice is a no-op.
pub fn reproject_collection(
    collection: FeatureCollection,
    to_crs: &Crs,
) -> anyhow::Result<FeatureCollection> {
    if collection.crs.is_equivalent(to_crs)? {
        log::debug!(
            "Collection is already in {}, skipping reprojection",
            to_crs
        );
        return Ok(FeatureCollection {
            crs: to_crs.clone(),
            ..collection
        });
    }
    log::debug!("Reprojecting from {} to {}", collection.crs, to_crs);
    let projection =
        proj::Proj::new_known_crs(collection.crs.definition(), to_crs.definition(), None)
            .map_err(|err| {
                anyhow!(
                    "Could not create transformation from {} to {}, {}",
                    collection.crs,
                    to_crs,
                    err
                )
            })?;
    let features: anyhow::Result<Vec<Feature>> = collection
        .features
        .into_iter()
        .map(|feature| {
            let geometry = feature
                .geometry
                .transformed(&projection)
                .map_err(|err| anyhow!("Could not project geometry, {}", err))?;
            Ok(Feature {
                geometry,
                attributes: feature.attributes,
            })
        })
        .collect();
    Ok(FeatureCollection {
        schema: collection.schema,
        features: features?,
        crs: to_crs.clone(),
    })
}
