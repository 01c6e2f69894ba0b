use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Debug;

pub type VehicleId = u64;

/// Label used for vehicle attributes the detector does not provide.
pub const UNKNOWN_LABEL: &str = "Unknown";

fn unknown_label() -> String {
    UNKNOWN_LABEL.to_string()
}

/// Center based bounding box as reported by the vehicle detector.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct VehicleCoordinates {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl VehicleCoordinates {
    pub fn from_corners(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        let width = (x_max - x_min).max(0.0);
        let height = (y_max - y_min).max(0.0);
        Self {
            x: x_min + width / 2.0,
            y: y_min + height / 2.0,
            width,
            height,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct DetectedVehicle {
    pub vehicle_id: VehicleId,
    pub vehicle_type: String,
    pub detection_confidence: f32,
    pub vehicle_coordinates: VehicleCoordinates,
    #[serde(default = "unknown_label")]
    pub color_info: String,
    #[serde(default = "unknown_label")]
    pub model_info: String,
}

impl DetectedVehicle {
    pub fn new(
        vehicle_id: VehicleId,
        vehicle_type: impl Into<String>,
        detection_confidence: f32,
        vehicle_coordinates: VehicleCoordinates,
    ) -> Self {
        Self {
            vehicle_id,
            vehicle_type: vehicle_type.into(),
            detection_confidence,
            vehicle_coordinates,
            color_info: unknown_label(),
            model_info: unknown_label(),
        }
    }
}

impl Debug for DetectedVehicle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectedVehicle")
            .field("vehicle_id", &self.vehicle_id)
            .field("vehicle_type", &self.vehicle_type)
            .field("detection_confidence", &self.detection_confidence)
            .finish()
    }
}

/// Integer center box written into fused records.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VehicleBox {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl From<VehicleCoordinates> for VehicleBox {
    fn from(c: VehicleCoordinates) -> Self {
        Self {
            x: c.x as i64,
            y: c.y as i64,
            width: c.width as i64,
            height: c.height as i64,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DetectionBox {
    pub xmin: i64,
    pub ymin: i64,
    pub xmax: i64,
    pub ymax: i64,
}

impl DetectionBox {
    pub fn from_slice(det_box: Option<&[f32]>) -> Self {
        match det_box {
            Some([xmin, ymin, xmax, ymax, ..]) => Self {
                xmin: *xmin as i64,
                ymin: *ymin as i64,
                xmax: *xmax as i64,
                ymax: *ymax as i64,
            },
            _ => Self::default(),
        }
    }
}

/// Rounds a confidence to two decimals.
pub fn round_confidence(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

/// One plate found by the recognizer in one input image.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PlateCandidate {
    pub detection_bbox: DetectionBox,
    pub detection_confidence: Option<f32>,
    pub recognition_text: String,
    pub recognition_confidence: Option<f32>,
}

impl PlateCandidate {
    pub fn new(
        det_box: Option<&[f32]>,
        det_conf: Option<f32>,
        rec_text: Option<String>,
        rec_conf: Option<f32>,
    ) -> Self {
        Self {
            detection_bbox: DetectionBox::from_slice(det_box),
            detection_confidence: det_conf.map(round_confidence),
            recognition_text: rec_text.unwrap_or_default(),
            recognition_confidence: rec_conf.map(round_confidence),
        }
    }

    pub fn has_text(&self) -> bool {
        !self.recognition_text.is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FusedVehicleRecord {
    pub vehicle_id: VehicleId,
    pub vehicle_type: String,
    pub detection_confidence: f32,
    pub color_info: String,
    pub model_info: String,
    pub bbox: VehicleBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recognition_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recognition_confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection_bbox: Option<DetectionBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plate_detection_confidence: Option<f32>,
}

impl FusedVehicleRecord {
    pub fn new(vehicle: &DetectedVehicle, plate: Option<&PlateCandidate>) -> Self {
        let mut record = Self {
            vehicle_id: vehicle.vehicle_id,
            vehicle_type: vehicle.vehicle_type.clone(),
            detection_confidence: vehicle.detection_confidence,
            color_info: vehicle.color_info.clone(),
            model_info: vehicle.model_info.clone(),
            bbox: vehicle.vehicle_coordinates.into(),
            recognition_text: None,
            recognition_confidence: None,
            detection_bbox: None,
            plate_detection_confidence: None,
        };
        if let Some(plate) = plate {
            record.recognition_text = Some(plate.recognition_text.clone());
            record.recognition_confidence = plate.recognition_confidence;
            record.detection_bbox = Some(plate.detection_bbox);
            record.plate_detection_confidence = plate.detection_confidence;
        }
        record
    }

    pub fn has_plate_text(&self) -> bool {
        self.recognition_text
            .as_deref()
            .is_some_and(|text| !text.is_empty())
    }
}

/// Plate that is not attached to any vehicle.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PlateRecord {
    pub vehicle_id: Option<VehicleId>,
    pub detection_confidence: Option<f32>,
    pub recognition_text: String,
    pub recognition_confidence: Option<f32>,
    pub detection_bbox: DetectionBox,
}

impl From<PlateCandidate> for PlateRecord {
    fn from(plate: PlateCandidate) -> Self {
        Self {
            vehicle_id: None,
            detection_confidence: plate.detection_confidence,
            recognition_text: plate.recognition_text,
            recognition_confidence: plate.recognition_confidence,
            detection_bbox: plate.detection_bbox,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ResultBundle {
    pub vehicles: Vec<FusedVehicleRecord>,
    pub plates: Vec<PlateRecord>,
}

/// One line of a batch request. Unknown fields are carried through to the result.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BatchEntry {
    #[serde(rename = "filePath")]
    pub file_path: String,
    #[serde(
        rename = "docName",
        alias = "DocName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub doc_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum BatchOutcome {
    Processed(ResultBundle),
    Failed { error: String },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BatchResult {
    #[serde(flatten)]
    pub entry: BatchEntry,
    #[serde(flatten)]
    pub outcome: BatchOutcome,
}

impl BatchResult {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, BatchOutcome::Failed { .. })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
}
