#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::config::{AnalysisSettings, DetectionSettings};
use crate::detect::backend::Detector;
use crate::detect::result::{BoundingBox, Detection, DetectionCategory};

use super::COCO_CLASSES;

const NMS_IOU: f32 = 0.45;

/// Tract-based object detector for YOLOv5-layout ONNX exports.
///
/// Expects a `1x3xSxS` float input and a `1xNx(5+C)` output where every row is
/// `cx, cy, w, h, objectness, class scores...` in input-pixel units.
pub struct OnnxDetector {
    model: TypedSimplePlan<TypedModel>,
    input_size: u32,
    confidence_threshold: f32,
}

impl OnnxDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            confidence_threshold: 0.5,
        })
    }

    pub fn from_settings(settings: &DetectionSettings) -> Result<Self> {
        Ok(Self::new(&settings.model_path, settings.input_size)?
            .with_threshold(settings.confidence))
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &RgbImage) -> Tensor {
        let side = self.input_size;
        let resized = image::imageops::resize(frame, side, side, FilterType::Triangle);
        let side = side as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
        });
        input.into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>, width: u32, height: u32) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[2] < 6 {
            return Err(anyhow!("unexpected output shape {:?}", shape));
        }
        let rows = view
            .into_shape((shape[1], shape[2]))
            .context("reshape model output")?;

        let sx = width as f32 / self.input_size as f32;
        let sy = height as f32 / self.input_size as f32;
        let mut candidates: Vec<(usize, Detection)> = Vec::new();
        for row in rows.outer_iter() {
            let objectness = row[4];
            if objectness < self.confidence_threshold {
                continue;
            }
            let Some((class_id, class_score)) = row
                .iter()
                .skip(5)
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            let confidence = (objectness * class_score).clamp(0.0, 1.0);
            if confidence < self.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            let bbox = BoundingBox::new(
                ((cx - w / 2.0) * sx).round() as i32,
                ((cy - h / 2.0) * sy).round() as i32,
                ((cx + w / 2.0) * sx).round() as i32,
                ((cy + h / 2.0) * sy).round() as i32,
            )
            .and_then(|b| b.clamp_to(width, height));
            let Some(bbox) = bbox else {
                continue;
            };
            let label = COCO_CLASSES.get(class_id).copied().unwrap_or("unknown");
            candidates.push((class_id, Detection::object(bbox, label, confidence)));
        }

        Ok(non_max_suppression(candidates))
    }
}

/// Greedy per-class NMS, highest confidence first.
fn non_max_suppression(mut candidates: Vec<(usize, Detection)>) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.1.confidence.total_cmp(&a.1.confidence));
    let mut kept: Vec<(usize, Detection)> = Vec::new();
    for (class_id, det) in candidates {
        let overlaps = kept
            .iter()
            .any(|(k_class, k)| *k_class == class_id && k.bbox.iou(&det.bbox) > NMS_IOU);
        if !overlaps {
            kept.push((class_id, det));
        }
    }
    kept.into_iter().map(|(_, det)| det).collect()
}

impl Detector for OnnxDetector {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn category(&self) -> DetectionCategory {
        DetectionCategory::Object
    }

    fn tune(&mut self, settings: &AnalysisSettings) {
        self.confidence_threshold = settings.detection.confidence;
    }

    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame.width(), frame.height())
    }
}
