//! Bounding volumes and the transform math the tree builder needs.

use glam::{DMat3, DMat4, DVec3};

/// The bounding volume of a tile or of its content.
///
/// Boxes and spheres live in the tileset's Cartesian frame and are
/// transformed by tile transforms; regions and S2 cells are expressed in
/// global geographic coordinates and are unaffected by tile transforms.
#[derive(Clone, Debug, PartialEq)]
pub enum BoundingVolume {
    /// Oriented bounding box: center plus three half-axis column vectors.
    Box { center: DVec3, half_axes: DMat3 },

    /// Geographic region in radians plus height bounds in meters.
    Region {
        west: f64,
        south: f64,
        east: f64,
        north: f64,
        min_height: f64,
        max_height: f64,
    },

    /// Bounding sphere: center and radius.
    Sphere { center: DVec3, radius: f64 },

    /// S2 cell token with height bounds (bounding-volume extension).
    /// Carried opaquely for the host's selection layer.
    S2Cell {
        token: String,
        min_height: f64,
        max_height: f64,
    },
}

impl BoundingVolume {
    /// Parses the `boundingVolume` JSON object of a tileset document.
    ///
    /// Recognizes `box`, `region`, `sphere`, and the S2 bounding-volume
    /// extension. Returns `None` when no recognized representation is
    /// present or the arrays have the wrong arity.
    pub fn from_json(value: &serde_json::Value) -> Option<BoundingVolume> {
        let object = value.as_object()?;

        if let Some(numbers) = object.get("box").and_then(number_array) {
            if numbers.len() == 12 {
                return Some(BoundingVolume::Box {
                    center: DVec3::new(numbers[0], numbers[1], numbers[2]),
                    half_axes: DMat3::from_cols(
                        DVec3::new(numbers[3], numbers[4], numbers[5]),
                        DVec3::new(numbers[6], numbers[7], numbers[8]),
                        DVec3::new(numbers[9], numbers[10], numbers[11]),
                    ),
                });
            }
        }

        if let Some(numbers) = object.get("region").and_then(number_array) {
            if numbers.len() == 6 {
                return Some(BoundingVolume::Region {
                    west: numbers[0],
                    south: numbers[1],
                    east: numbers[2],
                    north: numbers[3],
                    min_height: numbers[4],
                    max_height: numbers[5],
                });
            }
        }

        if let Some(numbers) = object.get("sphere").and_then(number_array) {
            if numbers.len() == 4 {
                return Some(BoundingVolume::Sphere {
                    center: DVec3::new(numbers[0], numbers[1], numbers[2]),
                    radius: numbers[3],
                });
            }
        }

        if let Some(s2) = object
            .get("extensions")
            .and_then(|e| e.get("3DTILES_bounding_volume_S2"))
            .and_then(|v| v.as_object())
        {
            let token = s2.get("token")?.as_str()?.to_string();
            let min_height = s2.get("minimumHeight")?.as_f64()?;
            let max_height = s2.get("maximumHeight")?.as_f64()?;
            return Some(BoundingVolume::S2Cell {
                token,
                min_height,
                max_height,
            });
        }

        None
    }
}

fn number_array(value: &serde_json::Value) -> Option<Vec<f64>> {
    value.as_array()?.iter().map(|v| v.as_f64()).collect()
}

/// Applies a tile transform to a bounding volume.
///
/// Regions and S2 cells are global and pass through unchanged; boxes and
/// spheres are transformed in place.
pub fn transform_bounding_volume(transform: &DMat4, volume: &BoundingVolume) -> BoundingVolume {
    match volume {
        BoundingVolume::Box { center, half_axes } => BoundingVolume::Box {
            center: transform.transform_point3(*center),
            half_axes: DMat3::from_mat4(*transform) * *half_axes,
        },
        BoundingVolume::Sphere { center, radius } => BoundingVolume::Sphere {
            center: transform.transform_point3(*center),
            radius: radius * max_scale_component(transform),
        },
        BoundingVolume::Region { .. } | BoundingVolume::S2Cell { .. } => volume.clone(),
    }
}

/// Largest per-axis scale factor of a transform.
///
/// Geometric error is a distance metric, so composing a tile's transform
/// scales it by the largest axis scale rather than by the determinant.
pub fn max_scale_component(transform: &DMat4) -> f64 {
    let x = transform.x_axis.truncate().length();
    let y = transform.y_axis.truncate().length();
    let z = transform.z_axis.truncate().length();
    x.max(y).max(z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_box() {
        let value = json!({ "box": [1.0, 2.0, 3.0, 10.0, 0.0, 0.0, 0.0, 10.0, 0.0, 0.0, 0.0, 10.0] });
        let volume = BoundingVolume::from_json(&value).unwrap();
        match volume {
            BoundingVolume::Box { center, .. } => assert_eq!(center, DVec3::new(1.0, 2.0, 3.0)),
            other => panic!("expected box, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_region() {
        let value = json!({ "region": [-1.3, 0.6, -1.2, 0.7, 0.0, 100.0] });
        let volume = BoundingVolume::from_json(&value).unwrap();
        match volume {
            BoundingVolume::Region { west, max_height, .. } => {
                assert_eq!(west, -1.3);
                assert_eq!(max_height, 100.0);
            }
            other => panic!("expected region, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_sphere() {
        let value = json!({ "sphere": [0.0, 0.0, 0.0, 5000.0] });
        let volume = BoundingVolume::from_json(&value).unwrap();
        assert!(matches!(volume, BoundingVolume::Sphere { radius, .. } if radius == 5000.0));
    }

    #[test]
    fn test_parse_s2_extension() {
        let value = json!({
            "extensions": {
                "3DTILES_bounding_volume_S2": {
                    "token": "89c6c7",
                    "minimumHeight": 0.0,
                    "maximumHeight": 1000.0
                }
            }
        });
        let volume = BoundingVolume::from_json(&value).unwrap();
        assert!(matches!(volume, BoundingVolume::S2Cell { ref token, .. } if token == "89c6c7"));
    }

    #[test]
    fn test_parse_rejects_wrong_arity() {
        let value = json!({ "box": [1.0, 2.0] });
        assert!(BoundingVolume::from_json(&value).is_none());
    }

    #[test]
    fn test_transform_translates_box() {
        let volume = BoundingVolume::Box {
            center: DVec3::ZERO,
            half_axes: DMat3::IDENTITY,
        };
        let transform = DMat4::from_translation(DVec3::new(10.0, 0.0, 0.0));
        match transform_bounding_volume(&transform, &volume) {
            BoundingVolume::Box { center, .. } => assert_eq!(center, DVec3::new(10.0, 0.0, 0.0)),
            other => panic!("expected box, got {:?}", other),
        }
    }

    #[test]
    fn test_transform_leaves_region_untouched() {
        let volume = BoundingVolume::Region {
            west: -1.0,
            south: -0.5,
            east: 1.0,
            north: 0.5,
            min_height: 0.0,
            max_height: 10.0,
        };
        let transform = DMat4::from_scale(DVec3::splat(4.0));
        assert_eq!(transform_bounding_volume(&transform, &volume), volume);
    }

    #[test]
    fn test_max_scale_component() {
        let transform = DMat4::from_scale(DVec3::new(2.0, 3.0, 0.5));
        assert!((max_scale_component(&transform) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_sphere_radius_scales_by_max_component() {
        let volume = BoundingVolume::Sphere {
            center: DVec3::ZERO,
            radius: 1.0,
        };
        let transform = DMat4::from_scale(DVec3::new(1.0, 5.0, 2.0));
        match transform_bounding_volume(&transform, &volume) {
            BoundingVolume::Sphere { radius, .. } => assert!((radius - 5.0).abs() < 1e-12),
            other => panic!("expected sphere, got {:?}", other),
        }
    }
}
