//! Region extraction: turns detector output into per-vehicle crops.

use crate::{
    api::{DetectedVehicle, VehicleId},
    image::Image,
};
use tracing::debug;

pub const DEFAULT_VEHICLE_TYPES: [&str; 8] = [
    "car",
    "bus",
    "truck",
    "minibus",
    "lorry",
    "motorcycle",
    "ship",
    "taxi",
];

/// Axis aligned rectangle in pixel coordinates, `right` and `bottom` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRectangle {
    pub top: i64,
    pub bottom: i64,
    pub left: i64,
    pub right: i64,
}

impl CropRectangle {
    /// Center and size are integers already, the half extents are truncated toward zero.
    pub fn from_center_size(x: i64, y: i64, width: i64, height: i64) -> Self {
        let half_w = width as f64 / 2.0;
        let half_h = height as f64 / 2.0;
        Self {
            top: (y as f64 - half_h) as i64,
            bottom: (y as f64 + half_h) as i64,
            left: (x as f64 - half_w) as i64,
            right: (x as f64 + half_w) as i64,
        }
    }

    pub fn from_vehicle(vehicle: &DetectedVehicle) -> Self {
        let c = vehicle.vehicle_coordinates;
        Self::from_center_size(c.x as i64, c.y as i64, c.width as i64, c.height as i64)
    }

    /// Returns `(x, y, width, height)`.
    pub fn center_size(&self) -> (i64, i64, i64, i64) {
        let width = self.right - self.left;
        let height = self.bottom - self.top;
        (self.left + width / 2, self.top + height / 2, width, height)
    }

    pub fn area(&self) -> i64 {
        (self.right - self.left).max(0) * (self.bottom - self.top).max(0)
    }

    /// Clamps the rectangle to an image of the given size.
    pub fn clip(&self, width: usize, height: usize) -> Option<CropRectangle> {
        let width = width as i64;
        let height = height as i64;
        let clipped = CropRectangle {
            top: self.top.clamp(0, height),
            bottom: self.bottom.clamp(0, height),
            left: self.left.clamp(0, width),
            right: self.right.clamp(0, width),
        };
        (clipped.area() > 0).then_some(clipped)
    }
}

/// Case insensitive allow-list of vehicle types worth sending to the recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleTypeFilter {
    types: Vec<String>,
}

impl Default for VehicleTypeFilter {
    fn default() -> Self {
        Self::new(DEFAULT_VEHICLE_TYPES)
    }
}

impl VehicleTypeFilter {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            types: types
                .into_iter()
                .map(|t| t.as_ref().trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn allows(&self, vehicle_type: &str) -> bool {
        let vehicle_type = vehicle_type.to_lowercase();
        self.types.iter().any(|t| *t == vehicle_type)
    }
}

/// A kept vehicle together with the pixels the recognizer will see for it.
#[derive(Debug, Clone)]
pub struct VehicleCrop {
    pub vehicle: DetectedVehicle,
    pub rect: CropRectangle,
    pub image: Image,
}

impl VehicleCrop {
    pub fn vehicle_id(&self) -> VehicleId {
        self.vehicle.vehicle_id
    }
}

/// Keeps detector order. Vehicles of other types and empty crops are dropped.
pub fn extract_regions(
    image: &Image,
    vehicles: &[DetectedVehicle],
    filter: &VehicleTypeFilter,
) -> Vec<VehicleCrop> {
    let mut crops = Vec::with_capacity(vehicles.len());
    for vehicle in vehicles {
        if !filter.allows(&vehicle.vehicle_type) {
            debug!(?vehicle, "Skipping vehicle type");
            continue;
        }
        let rect = CropRectangle::from_vehicle(vehicle);
        match image.crop(&rect) {
            Some(crop) => crops.push(VehicleCrop {
                vehicle: vehicle.clone(),
                rect,
                image: crop,
            }),
            None => debug!(?vehicle, ?rect, "Skipping empty crop"),
        }
    }
    crops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::VehicleCoordinates;

    fn vehicle(
        id: VehicleId,
        vehicle_type: &str,
        x: f32,
        y: f32,
        w: f32,
        h: f32,
    ) -> DetectedVehicle {
        DetectedVehicle::new(
            id,
            vehicle_type,
            0.8,
            VehicleCoordinates {
                x,
                y,
                width: w,
                height: h,
            },
        )
    }

    fn blank(width: usize, height: usize) -> Image {
        Image::new(None, width, height, vec![0; width * height * 3]).unwrap()
    }

    #[test]
    fn test_crop_rectangle_round_trip() {
        let rect = CropRectangle::from_center_size(100, 100, 40, 20);
        assert_eq!(
            rect,
            CropRectangle {
                top: 90,
                bottom: 110,
                left: 80,
                right: 120,
            }
        );
        assert_eq!(rect.center_size(), (100, 100, 40, 20));
    }

    #[test]
    fn test_crop_rectangle_odd_size_truncates() {
        let rect = CropRectangle::from_center_size(10, 10, 5, 3);
        // 10 - 2.5 -> 7, 10 + 2.5 -> 12, 10 - 1.5 -> 8, 10 + 1.5 -> 11
        assert_eq!((rect.left, rect.right, rect.top, rect.bottom), (7, 12, 8, 11));
        let (x, y, w, h) = rect.center_size();
        assert!((x - 10).abs() <= 1 && (y - 10).abs() <= 1);
        assert!((w - 5).abs() <= 1 && (h - 3).abs() <= 1);
    }

    #[test]
    fn test_clip_to_image() {
        let rect = CropRectangle::from_center_size(5, 5, 20, 20);
        let clipped = rect.clip(8, 6).unwrap();
        assert_eq!(
            clipped,
            CropRectangle {
                top: 0,
                bottom: 6,
                left: 0,
                right: 8,
            }
        );
        assert!(CropRectangle::from_center_size(5, 5, 0, 20).clip(8, 6).is_none());
    }

    #[test]
    fn test_filter_is_case_insensitive() {
        let filter = VehicleTypeFilter::default();
        assert!(filter.allows("Car"));
        assert!(filter.allows("TRUCK"));
        assert!(!filter.allows("person"));

        let custom = VehicleTypeFilter::new(["Boat", " "]);
        assert!(custom.allows("boat"));
        assert!(!custom.allows("car"));
    }

    #[test]
    fn test_extract_regions_keeps_order_and_pairs() {
        let image = blank(200, 200);
        let vehicles = vec![
            vehicle(1, "car", 50.0, 50.0, 20.0, 20.0),
            vehicle(2, "person", 60.0, 60.0, 20.0, 20.0),
            vehicle(3, "bus", 100.0, 100.0, 0.0, 30.0),
            vehicle(4, "Truck", 150.0, 150.0, 40.0, 20.0),
            vehicle(5, "taxi", 500.0, 500.0, 10.0, 10.0),
        ];
        let crops = extract_regions(&image, &vehicles, &VehicleTypeFilter::default());
        let ids: Vec<_> = crops.iter().map(VehicleCrop::vehicle_id).collect();
        assert_eq!(ids, vec![1, 4]);
        assert_eq!((crops[1].image.width, crops[1].image.height), (40, 20));
    }
}
