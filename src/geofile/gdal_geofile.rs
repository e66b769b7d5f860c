use anyhow::{anyhow, Context};
use gdal::vector::{FieldValue, LayerAccess, OGRFieldType, OGRwkbGeometryType};
use indicatif::ProgressBar;
use serde::Deserialize;
use std::{collections::HashSet, path::Path};

use super::feature::{
    AttributeValue, Feature, FeatureCollection, FeatureMap, FieldDefinition, FieldType,
};
use crate::crs::crs_utils::Crs;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GdalDriverType {
    #[default]
    Shapefile,
    GeoPackage,
    GeoJson,
}

impl GdalDriverType {
    pub fn name(&self) -> &'static str {
        match self {
            GdalDriverType::Shapefile => "ESRI Shapefile",
            GdalDriverType::GeoPackage => "GPKG",
            GdalDriverType::GeoJson => "GeoJSON",
        }
    }
}

/// Write a feature collection to a single layer named `layer_name`.
///
/// For the shapefile driver `output_filepath` is a directory, the `.shp` and its companion files
/// inside it are named after the layer.
pub fn write_features_to_geofile(
    collection: &FeatureCollection,
    output_filepath: &Path,
    layer_name: &str,
    driver: GdalDriverType,
) -> anyhow::Result<()> {
    gdal::DriverManager::register_all();
    let driver =
        gdal::DriverManager::get_driver_by_name(driver.name()).context("Getting GDAL driver")?;

    let layer_type = layer_geometry_type(&collection.features)?;
    let crs = collection.crs.to_spatial_ref()?;
    log::debug!("Using spatial ref {} for writing geofile", collection.crs);

    let mut dataset = driver
        .create_vector_only(output_filepath)
        .with_context(|| format!("Creating dataset {:?}", output_filepath))?;
    let layer_options = gdal::LayerOptions {
        name: layer_name,
        srs: Some(&crs),
        ty: layer_type,
        options: None,
    };

    let mut layer = dataset.create_layer(layer_options)?;

    log::info!("Setting up fields");
    let schema = output_schema(collection);
    let field_definitions: Vec<(&str, OGRFieldType::Type)> = schema
        .iter()
        .map(|field| (&field.name as &str, ogr_field_type(field.field_type)))
        .collect();
    layer.create_defn_fields(&field_definitions)?;

    log::info!(
        "Writing {} features to {:?}",
        collection.len(),
        output_filepath
    );
    unsafe {
        // Start a transaction in case the driver supports transactions, e.g. GeoPackage.
        // Committing all features once as opposed to per-feature is a massive speedup for these drivers.
        gdal_sys::OGR_L_StartTransaction(layer.c_layer());
    };
    let bar = ProgressBar::new(collection.len() as u64);
    for feature in &collection.features {
        let wkb = wkb::geom_to_wkb(&feature.geometry)
            .map_err(|err| anyhow!("Could not write geometry to WKB, {:?}", err))?;
        let geometry = gdal::vector::Geometry::from_wkb(&wkb)?;

        let mut field_names = Vec::new();
        let mut values = Vec::new();
        if let Some(attributes) = &feature.attributes {
            for field in &schema {
                if let Some(value) = attributes.get(&field.name) {
                    field_names.push(&field.name as &str);
                    values.push(field_value(value, field.field_type));
                }
            }
        }
        if field_names.is_empty() {
            layer.create_feature(geometry)?;
        } else {
            layer.create_feature_fields(geometry, &field_names, &values)?;
        }

        bar.inc(1);
    }
    unsafe {
        gdal_sys::OGR_L_CommitTransaction(layer.c_layer());
    };
    bar.finish_and_clear();
    Ok(())
}

/// Collection schema extended with attributes that appear on features but not in the schema.
fn output_schema(collection: &FeatureCollection) -> Vec<FieldDefinition> {
    let mut schema = collection.schema.clone();
    let mut known: HashSet<String> = schema.iter().map(|field| field.name.clone()).collect();
    for attributes in collection.features.iter().filter_map(|f| f.attributes.as_ref()) {
        let mut names: Vec<&String> = attributes.keys().collect();
        names.sort();
        for name in names {
            let value_type = attributes[name].field_type();
            if known.insert(name.clone()) {
                schema.push(FieldDefinition::new(name, value_type));
            } else if let Some(field) = schema.iter_mut().find(|field| &field.name == name) {
                field.field_type = field.field_type.widen(value_type);
            }
        }
    }
    schema
}

fn ogr_field_type(field_type: FieldType) -> OGRFieldType::Type {
    match field_type {
        FieldType::Integer => OGRFieldType::OFTInteger64,
        FieldType::Real => OGRFieldType::OFTReal,
        FieldType::String => OGRFieldType::OFTString,
    }
}

fn field_value(value: &AttributeValue, field_type: FieldType) -> FieldValue {
    match (field_type, value) {
        (FieldType::Integer, AttributeValue::Integer(v)) => FieldValue::Integer64Value(*v),
        (FieldType::Real, AttributeValue::Integer(v)) => FieldValue::RealValue(*v as f64),
        (FieldType::Real, AttributeValue::Real(v)) => FieldValue::RealValue(*v),
        (_, AttributeValue::String(v)) => FieldValue::StringValue(v.clone()),
        (_, AttributeValue::Integer(v)) => FieldValue::StringValue(v.to_string()),
        (_, AttributeValue::Real(v)) => FieldValue::StringValue(v.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GeometryKind {
    Point,
    Line,
    Polygon,
}

fn geometry_kind(geometry: &geo::Geometry) -> anyhow::Result<(GeometryKind, bool)> {
    match geometry {
        geo::Geometry::Point(_) => Ok((GeometryKind::Point, false)),
        geo::Geometry::MultiPoint(_) => Ok((GeometryKind::Point, true)),
        geo::Geometry::LineString(_) => Ok((GeometryKind::Line, false)),
        geo::Geometry::MultiLineString(_) => Ok((GeometryKind::Line, true)),
        geo::Geometry::Polygon(_) => Ok((GeometryKind::Polygon, false)),
        geo::Geometry::MultiPolygon(_) => Ok((GeometryKind::Polygon, true)),
        _ => Err(anyhow!("Cannot write geometry type {:?} to file.", geometry)),
    }
}

/// Single layer geometry type able to hold all features. Single and multi variants of the same
/// kind unify to the multi variant.
fn layer_geometry_type(features: &[Feature]) -> anyhow::Result<OGRwkbGeometryType::Type> {
    use OGRwkbGeometryType::*;
    let mut layer_kind: Option<(GeometryKind, bool)> = None;
    for feature in features {
        let (kind, multi) = geometry_kind(&feature.geometry)?;
        layer_kind = match layer_kind {
            None => Some((kind, multi)),
            Some((layer_kind, layer_multi)) if layer_kind == kind => {
                Some((kind, layer_multi || multi))
            }
            Some((layer_kind, _)) => {
                return Err(anyhow!(
                    "Cannot write mixed geometry kinds {:?} and {:?} to one layer.",
                    layer_kind,
                    kind
                ))
            }
        };
    }
    Ok(match layer_kind {
        None => wkbUnknown,
        Some((GeometryKind::Point, false)) => wkbPoint,
        Some((GeometryKind::Point, true)) => wkbMultiPoint,
        Some((GeometryKind::Line, false)) => wkbLineString,
        Some((GeometryKind::Line, true)) => wkbMultiLineString,
        Some((GeometryKind::Polygon, false)) => wkbPolygon,
        Some((GeometryKind::Polygon, true)) => wkbMultiPolygon,
    })
}

/// Read the single layer of a vector dataset, e.g. a shapefile or a directory holding one.
pub fn read_features_from_geofile(filepath: &Path) -> anyhow::Result<FeatureCollection> {
    gdal::DriverManager::register_all();
    let mut open_options = gdal::DatasetOptions::default();
    open_options.open_flags = gdal::GdalOpenFlags::GDAL_OF_VECTOR;
    let dataset = gdal::Dataset::open_ex(filepath, open_options)
        .with_context(|| format!("Opening {:?}", filepath))?;

    let layer_count = dataset.layer_count();
    if 0 == layer_count || 1 < layer_count {
        return Err(anyhow!(
            "Found {} layers, only one layer is supported.",
            layer_count
        ));
    }
    let mut layer = dataset.layer(0)?;
    let spatial_ref = layer
        .spatial_ref()
        .ok_or_else(|| anyhow!("Layer in {:?} has no spatial reference", filepath))?;
    let crs = Crs::from_spatial_ref(&spatial_ref)?;

    let schema: Vec<FieldDefinition> = layer
        .defn()
        .fields()
        .map(|field| FieldDefinition::new(&field.name(), field_type(field.field_type())))
        .collect();

    let mut features = Vec::new();
    for gdal_feature in layer.features() {
        let wkb = gdal_feature.geometry_by_index(0)?.wkb()?;
        let geometry = wkb::wkb_to_geom(&mut wkb.as_slice())
            .map_err(|err| anyhow!("Could not read geometry from WKB, {:?}", err))?;

        let mut attributes = FeatureMap::new();
        for (name, value) in gdal_feature.fields() {
            if let Some(value) = value {
                attributes.insert(name, attribute_value(value)?);
            }
        }
        features.push(Feature {
            geometry,
            attributes: Some(attributes),
        });
    }
    Ok(FeatureCollection::new(schema, features, crs))
}

fn field_type(ogr_type: OGRFieldType::Type) -> FieldType {
    match ogr_type {
        OGRFieldType::OFTInteger | OGRFieldType::OFTInteger64 => FieldType::Integer,
        OGRFieldType::OFTReal => FieldType::Real,
        _ => FieldType::String,
    }
}

fn attribute_value(value: FieldValue) -> anyhow::Result<AttributeValue> {
    match value {
        FieldValue::IntegerValue(v) => Ok(AttributeValue::Integer(v as i64)),
        FieldValue::Integer64Value(v) => Ok(AttributeValue::Integer(v)),
        FieldValue::RealValue(v) => Ok(AttributeValue::Real(v)),
        FieldValue::StringValue(v) => Ok(AttributeValue::String(v)),
        FieldValue::DateValue(v) => Ok(AttributeValue::String(v.format("%Y-%m-%d").to_string())),
        FieldValue::DateTimeValue(v) => Ok(AttributeValue::String(v.to_rfc3339())),
        other => Err(anyhow!("Unsupported field value {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use geo::{Area, BoundingRect};
    use rstest::rstest;
    use testdir::testdir;

    use super::*;

    /// Clockwise exterior ring, as stored in shapefiles.
    fn tract_polygon(x: f64, y: f64) -> geo::Geometry {
        geo::Geometry::Polygon(geo::Polygon::new(
            geo::LineString::from(vec![
                (x, y),
                (x, y + 0.05),
                (x + 0.05, y + 0.05),
                (x + 0.05, y),
                (x, y),
            ]),
            vec![],
        ))
    }

    fn tracts() -> FeatureCollection {
        let features = vec![
            Feature {
                geometry: tract_polygon(-86.5, 32.4),
                attributes: Some(FeatureMap::from([
                    ("GEOID".to_string(), "01001020100".into()),
                    ("ALAND".to_string(), AttributeValue::Integer(9817366)),
                    ("INTPTLAT".to_string(), AttributeValue::Real(32.4771)),
                ])),
            },
            Feature {
                geometry: tract_polygon(-86.4, 32.5),
                attributes: Some(FeatureMap::from([
                    ("GEOID".to_string(), "01001020200".into()),
                    ("ALAND".to_string(), AttributeValue::Integer(3340507)),
                ])),
            },
        ];
        FeatureCollection::new(
            vec![
                FieldDefinition::new("GEOID", FieldType::String),
                FieldDefinition::new("ALAND", FieldType::Integer),
                FieldDefinition::new("INTPTLAT", FieldType::Real),
            ],
            features,
            Crs::from_epsg(4269),
        )
    }

    #[rstest]
    #[case(GdalDriverType::Shapefile, "tracts")]
    #[case(GdalDriverType::GeoPackage, "tracts.gpkg")]
    fn test_geofile_write_read_round_trip(
        #[case] driver: GdalDriverType,
        #[case] filename: &str,
    ) {
        let collection = tracts();
        let test_dir = testdir!();
        let geofile_filepath = test_dir.join(filename);

        write_features_to_geofile(&collection, &geofile_filepath, "tracts", driver).unwrap();
        let read_back = read_features_from_geofile(&geofile_filepath).unwrap();

        assert_eq!(read_back.len(), collection.len());
        assert!(read_back.crs.is_equivalent(&collection.crs).unwrap());
        let schema_names: Vec<&str> = read_back.schema.iter().map(|f| &f.name as &str).collect();
        assert_eq!(schema_names, vec!["GEOID", "ALAND", "INTPTLAT"]);
        for (expected, actual) in collection.features.iter().zip(read_back.features.iter()) {
            assert_eq!(expected.attribute("GEOID"), actual.attribute("GEOID"));
            assert_eq!(expected.attribute("ALAND"), actual.attribute("ALAND"));
            match (expected.attribute("INTPTLAT"), actual.attribute("INTPTLAT")) {
                (Some(AttributeValue::Real(a)), Some(AttributeValue::Real(b))) => {
                    assert_relative_eq!(*a, *b, epsilon = 1e-9)
                }
                (None, None) => {}
                (a, b) => panic!("Mismatched INTPTLAT {:?} and {:?}", a, b),
            }
            assert_relative_eq!(
                expected.geometry.unsigned_area(),
                actual.geometry.unsigned_area(),
                epsilon = 1e-12
            );
            let expected_bbox = expected.geometry.bounding_rect().unwrap();
            let actual_bbox = actual.geometry.bounding_rect().unwrap();
            assert_relative_eq!(expected_bbox.min().x, actual_bbox.min().x, epsilon = 1e-9);
            assert_relative_eq!(expected_bbox.min().y, actual_bbox.min().y, epsilon = 1e-9);
            assert_relative_eq!(expected_bbox.max().x, actual_bbox.max().x, epsilon = 1e-9);
            assert_relative_eq!(expected_bbox.max().y, actual_bbox.max().y, epsilon = 1e-9);
        }
    }

    #[rstest]
    fn test_shapefile_output_is_named_after_layer() {
        let test_dir = testdir!();
        let output = test_dir.join("us_tracts_2014");
        write_features_to_geofile(&tracts(), &output, "us_tracts_2014", GdalDriverType::Shapefile)
            .unwrap();
        for extension in ["shp", "shx", "dbf", "prj"] {
            assert!(output.join(format!("us_tracts_2014.{}", extension)).exists());
        }
    }

    #[rstest]
    fn test_empty_collection_writes_empty_layer() {
        let empty = FeatureCollection::new(
            vec![FieldDefinition::new("GEOID", FieldType::String)],
            vec![],
            Crs::from_epsg(4326),
        );
        let test_dir = testdir!();
        let geofile_filepath = test_dir.join("empty.gpkg");

        write_features_to_geofile(&empty, &geofile_filepath, "empty", GdalDriverType::GeoPackage)
            .unwrap();
        let read_back = read_features_from_geofile(&geofile_filepath).unwrap();

        assert!(read_back.is_empty());
        assert_eq!(read_back.schema, empty.schema);
        assert!(read_back.crs.is_equivalent(&empty.crs).unwrap());
    }

    #[rstest]
    fn test_output_schema_adds_attributes_missing_from_schema() {
        let features = vec![
            Feature {
                geometry: tract_polygon(-86.5, 32.4),
                attributes: Some(FeatureMap::from([
                    ("GEOID".to_string(), "01001020100".into()),
                    ("ALAND".to_string(), AttributeValue::Integer(9817366)),
                ])),
            },
            Feature {
                geometry: tract_polygon(-86.4, 32.5),
                attributes: Some(FeatureMap::from([(
                    "ALAND".to_string(),
                    AttributeValue::Real(3340507.5),
                )])),
            },
        ];
        let collection = FeatureCollection::new(
            vec![FieldDefinition::new("GEOID", FieldType::String)],
            features,
            Crs::from_epsg(4269),
        );

        assert_eq!(
            output_schema(&collection),
            vec![
                FieldDefinition::new("GEOID", FieldType::String),
                FieldDefinition::new("ALAND", FieldType::Real),
            ]
        );
    }

    #[rstest]
    fn test_read_fails_without_shapefile() {
        let test_dir = testdir!();
        let empty_state = test_dir.join("01_AL");
        std::fs::create_dir_all(&empty_state).unwrap();
        assert!(read_features_from_geofile(&empty_state).is_err());
    }

    #[rstest]
    fn test_layer_geometry_type_unifies_multi_variants() {
        let polygon = tract_polygon(0.0, 0.0);
        let multi_polygon = match tract_polygon(1.0, 1.0) {
            geo::Geometry::Polygon(p) => geo::Geometry::MultiPolygon(geo::MultiPolygon(vec![p])),
            _ => unreachable!(),
        };
        let features = vec![Feature::from(polygon.clone()), Feature::from(multi_polygon)];
        assert_eq!(
            layer_geometry_type(&features).unwrap(),
            OGRwkbGeometryType::wkbMultiPolygon
        );
        assert_eq!(
            layer_geometry_type(&[Feature::from(polygon)]).unwrap(),
            OGRwkbGeometryType::wkbPolygon
        );
        assert_eq!(layer_geometry_type(&[]).unwrap(), OGRwkbGeometryType::wkbUnknown);
    }

    #[rstest]
    fn test_layer_geometry_type_rejects_mixed_kinds() {
        let features = vec![
            Feature::from(tract_polygon(0.0, 0.0)),
            Feature::from(geo::Geometry::Point(geo::Point::new(0.0, 0.0))),
        ];
        assert!(layer_geometry_type(&features).is_err());
    }
}
