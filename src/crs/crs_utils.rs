use anyhow::{anyhow, Context};

pub type EpsgCode = u32;

pub fn epsg_code_to_authority_string(code: EpsgCode) -> String {
    format!("EPSG:{}", code)
}

/// A coordinate reference system, stored as a definition string understood by both GDAL and PROJ.
///
/// The definition is an `AUTHORITY:CODE` string when the CRS could be identified, WKT otherwise.
/// Unlike `gdal::spatial_ref::SpatialRef` this is plain data, so collections carrying it can be
/// moved between threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crs {
    definition: String,
}

impl Crs {
    pub fn from_epsg(code: EpsgCode) -> Self {
        Self {
            definition: epsg_code_to_authority_string(code),
        }
    }

    pub fn from_definition(definition: &str) -> Self {
        Self {
            definition: definition.to_string(),
        }
    }

    pub fn from_spatial_ref(spatial_ref: &gdal::spatial_ref::SpatialRef) -> anyhow::Result<Self> {
        let mut spatial_ref = spatial_ref.clone();
        // .prj files usually carry ESRI WKT without an authority node.
        if spatial_ref.auth_code().is_err() {
            let _ = spatial_ref.auto_identify_epsg();
        }
        if let (Ok(auth_name), Ok(auth_code)) = (spatial_ref.auth_name(), spatial_ref.auth_code())
        {
            return Ok(Self {
                definition: format!("{}:{}", auth_name, auth_code),
            });
        }
        let wkt = spatial_ref
            .to_wkt()
            .context("Converting spatial ref to WKT")?;
        if wkt.is_empty() {
            return Err(anyhow!(
                "Spatial ref has neither an authority code nor a WKT definition"
            ));
        }
        Ok(Self::from_definition(&wkt))
    }

    pub fn to_spatial_ref(&self) -> anyhow::Result<gdal::spatial_ref::SpatialRef> {
        gdal::spatial_ref::SpatialRef::from_definition(&self.definition).map_err(|err| {
            anyhow!(
                "Could not create spatial ref from '{}', {}",
                self.definition,
                err
            )
        })
    }

    pub fn definition(&self) -> &str {
        &self.definition
    }

    /// Whether both CRS describe the same system, even if their definitions differ textually.
    pub fn is_equivalent(&self, other: &Crs) -> anyhow::Result<bool> {
        if self.definition == other.definition {
            return Ok(true);
        }
        Ok(self.to_spatial_ref()? == other.to_spatial_ref()?)
    }
}

impl std::fmt::Display for Crs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.definition)
    }
}
