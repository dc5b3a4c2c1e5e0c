use std::sync::Mutex;

use image::imageops::{self, FilterType};
use image::DynamicImage;
use ndarray::{Array4, ArrayView3, ArrayViewD, Ix3};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;
use thiserror::Error;

const YOLO_INPUT_SIZE: u32 = 640;
const LETTERBOX_FILL: f32 = 114.0 / 255.0;

/// Index of "person" in the COCO taxonomy the YOLO models are trained on.
pub const PERSON_CLASS_ID: usize = 0;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
#[error("inference failed: {0}")]
pub struct InferenceError(pub String);

/// Counts people in one decoded image. Implementations hold no per-call state.
pub trait PersonCounter: Send + Sync {
    fn count_people(&self, image: &DynamicImage) -> Result<u32, InferenceError>;
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub class_id: usize,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Detection {
    fn iou(&self, other: &Detection) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.width * self.height + other.width * other.height - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    orig_w: f32,
    orig_h: f32,
}

impl Letterbox {
    fn for_size(width: u32, height: u32) -> Self {
        let input_size = YOLO_INPUT_SIZE as f32;
        let orig_w = width as f32;
        let orig_h = height as f32;
        let scale = (input_size / orig_w).min(input_size / orig_h);
        let new_w = (orig_w * scale).round();
        let new_h = (orig_h * scale).round();

        Self {
            scale,
            pad_x: ((input_size - new_w) / 2.0).floor(),
            pad_y: ((input_size - new_h) / 2.0).floor(),
            orig_w,
            orig_h,
        }
    }

    fn resized_dims(&self) -> (u32, u32) {
        (
            ((self.orig_w * self.scale).round() as u32).max(1),
            ((self.orig_h * self.scale).round() as u32).max(1),
        )
    }

    /// Map a center-format box in model input space back to the original image.
    fn to_original(&self, cx: f32, cy: f32, w: f32, h: f32) -> (f32, f32, f32, f32) {
        let x = ((cx - w / 2.0) - self.pad_x) / self.scale;
        let y = ((cy - h / 2.0) - self.pad_y) / self.scale;

        let x = x.max(0.0).min(self.orig_w);
        let y = y.max(0.0).min(self.orig_h);
        let width = (w / self.scale).min(self.orig_w - x);
        let height = (h / self.scale).min(self.orig_h - y);
        (x, y, width, height)
    }
}

pub struct ObjectDetector {
    session: Session,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl ObjectDetector {
    pub fn new(
        model_path: &str,
        confidence_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Self, BoxError> {
        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?;

        let session = if model_path.starts_with("http://") || model_path.starts_with("https://") {
            builder.commit_from_url(model_path)?
        } else {
            builder.commit_from_file(model_path)?
        };

        tracing::info!(model = %model_path, "object detection model loaded");

        Ok(Self {
            session,
            confidence_threshold,
            iou_threshold,
        })
    }

    pub fn detect(&mut self, image: &DynamicImage) -> Result<Vec<Detection>, BoxError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input_tensor, letterbox) = Self::preprocess(image);

        let tensor_ref = TensorRef::from_array_view(input_tensor.view())?.into_dyn();
        let outputs = self.session.run(ort::inputs![tensor_ref])?;

        // End-to-end export: separate "logits" and "pred_boxes" outputs
        if let (Some(logits_val), Some(boxes_val)) =
            (outputs.get("logits"), outputs.get("pred_boxes"))
        {
            let logits = logits_val.try_extract_array::<f32>()?.to_owned();
            let boxes = boxes_val.try_extract_array::<f32>()?.to_owned();
            drop(outputs);

            return Self::postprocess_end_to_end(
                &logits.view(),
                &boxes.view(),
                self.confidence_threshold,
                &letterbox,
            );
        }

        // Classic ultralytics export: one [1, 4 + classes, anchors] tensor
        let Some(dense_val) = outputs.get("output0") else {
            return Err(
                "Unsupported model format: expected 'logits'/'pred_boxes' or 'output0' outputs"
                    .into(),
            );
        };
        let dense = dense_val.try_extract_array::<f32>()?.to_owned();
        drop(outputs);

        let dense = dense.view().into_dimensionality::<Ix3>()?;
        let candidates = Self::postprocess_dense(&dense, self.confidence_threshold, &letterbox);
        Ok(non_max_suppression(candidates, self.iou_threshold))
    }

    fn preprocess(image: &DynamicImage) -> (Array4<f32>, Letterbox) {
        let rgb = image.to_rgb8();
        let letterbox = Letterbox::for_size(rgb.width(), rgb.height());
        let (new_w, new_h) = letterbox.resized_dims();
        let resized = imageops::resize(&rgb, new_w, new_h, FilterType::Triangle);

        let size = YOLO_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::from_elem((1, 3, size, size), LETTERBOX_FILL);
        let pad_x = letterbox.pad_x as usize;
        let pad_y = letterbox.pad_y as usize;

        for (x, y, pixel) in resized.enumerate_pixels() {
            let tx = x as usize + pad_x;
            let ty = y as usize + pad_y;
            if tx >= size || ty >= size {
                continue;
            }
            tensor[[0, 0, ty, tx]] = pixel[0] as f32 / 255.0;
            tensor[[0, 1, ty, tx]] = pixel[1] as f32 / 255.0;
            tensor[[0, 2, ty, tx]] = pixel[2] as f32 / 255.0;
        }

        (tensor, letterbox)
    }

    fn postprocess_end_to_end(
        logits: &ArrayViewD<f32>,
        boxes: &ArrayViewD<f32>,
        confidence_threshold: f32,
        letterbox: &Letterbox,
    ) -> Result<Vec<Detection>, BoxError> {
        let logits_shape = logits.shape();
        let boxes_shape = boxes.shape();

        // Expected shapes: logits [1, 300, 80], boxes [1, 300, 4]
        if logits_shape.len() < 2 || boxes_shape.len() < 2 {
            return Ok(Vec::new());
        }

        let num_detections = if logits_shape.len() == 3 {
            logits_shape[1]
        } else {
            logits_shape[0]
        };
        let num_classes = if logits_shape.len() == 3 {
            logits_shape[2]
        } else {
            logits_shape[1]
        };

        let logits_flat = logits.as_slice().ok_or("Cannot get logits slice")?;
        let boxes_flat = boxes.as_slice().ok_or("Cannot get boxes slice")?;
        if boxes_flat.len() < num_detections * 4 {
            return Err("pred_boxes shorter than logits".into());
        }

        let input_size = YOLO_INPUT_SIZE as f32;
        let mut detections = Vec::new();

        for i in 0..num_detections {
            let mut max_score = 0.0f32;
            let mut max_class = 0usize;

            for j in 0..num_classes {
                let logit = logits_flat[i * num_classes + j];
                let score = 1.0 / (1.0 + (-logit).exp()); // sigmoid
                if score > max_score {
                    max_score = score;
                    max_class = j;
                }
            }

            if max_score < confidence_threshold {
                continue;
            }

            // Box format: (cx, cy, w, h) normalized to [0, 1]
            let (x, y, width, height) = letterbox.to_original(
                boxes_flat[i * 4] * input_size,
                boxes_flat[i * 4 + 1] * input_size,
                boxes_flat[i * 4 + 2] * input_size,
                boxes_flat[i * 4 + 3] * input_size,
            );

            detections.push(Detection {
                class_id: max_class,
                confidence: max_score,
                x,
                y,
                width,
                height,
            });
        }

        Ok(detections)
    }

    /// Rows 0..4 are (cx, cy, w, h) in input pixels, the rest are class scores.
    fn postprocess_dense(
        output: &ArrayView3<f32>,
        confidence_threshold: f32,
        letterbox: &Letterbox,
    ) -> Vec<Detection> {
        let (_, rows, anchors) = output.dim();
        if rows <= 4 {
            return Vec::new();
        }

        let mut detections = Vec::new();
        for i in 0..anchors {
            let mut max_score = 0.0f32;
            let mut max_class = 0usize;
            for class in 0..rows - 4 {
                let score = output[[0, 4 + class, i]];
                if score > max_score {
                    max_score = score;
                    max_class = class;
                }
            }

            if max_score < confidence_threshold {
                continue;
            }

            let (x, y, width, height) = letterbox.to_original(
                output[[0, 0, i]],
                output[[0, 1, i]],
                output[[0, 2, i]],
                output[[0, 3, i]],
            );

            detections.push(Detection {
                class_id: max_class,
                confidence: max_score,
                x,
                y,
                width,
                height,
            });
        }

        detections
    }
}

/// Greedy per-class NMS, highest confidence first.
fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && k.iou(&candidate) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// `PersonCounter` backed by an ONNX YOLO model. The session needs `&mut` to
/// run, so concurrent requests take turns on it.
pub struct OnnxPersonCounter {
    detector: Mutex<ObjectDetector>,
}

impl OnnxPersonCounter {
    pub fn new(detector: ObjectDetector) -> Self {
        Self {
            detector: Mutex::new(detector),
        }
    }
}

impl PersonCounter for OnnxPersonCounter {
    fn count_people(&self, image: &DynamicImage) -> Result<u32, InferenceError> {
        let mut detector = self
            .detector
            .lock()
            .map_err(|_| InferenceError("detector lock poisoned".to_string()))?;

        let detections = detector
            .detect(image)
            .map_err(|e| InferenceError(e.to_string()))?;

        let people = detections
            .iter()
            .filter(|d| d.class_id == PERSON_CLASS_ID)
            .count();
        Ok(people as u32)
    }
}
