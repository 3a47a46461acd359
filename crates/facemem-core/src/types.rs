use serde::Serialize;

/// Dimension of ArcFace embeddings produced by the shipped recognizer.
pub const EMBEDDING_DIM: usize = 512;

/// Enrollment rejects a face closer than this to an existing identity.
pub const DEDUP_THRESHOLD: f32 = 0.5;
/// Recognition accepts a face closer than this to a stored identity.
pub const RECOGNITION_THRESHOLD: f32 = 0.7;
/// Faces evaluated per recognition request, in detector order.
pub const MAX_FACES_PER_IMAGE: usize = 8;

/// Distance limits for the two services. Both comparisons are strict (`<`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub dedup: f32,
    pub recognition: f32,
    pub max_faces: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            dedup: DEDUP_THRESHOLD,
            recognition: RECOGNITION_THRESHOLD,
            max_faces: MAX_FACES_PER_IMAGE,
        }
    }
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Box area in pixels (width × height). Degenerate boxes report 0.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 { inter / union } else { 0.0 }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
///
/// The embedder L2-normalizes its output; the store compares embeddings as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// False if any component is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A face reported by the embedder for one image. Never persisted.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub embedding: Embedding,
    /// Area of the detection box; the largest one wins at enrollment.
    pub box_area: f32,
}

/// One enrolled person.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRecord {
    pub label: String,
    pub embedding: Embedding,
}

/// A recognized face: the stored label and a display confidence in [0, 100].
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub label: String,
    pub confidence: f32,
}

/// Map an L2 distance onto a [0, 100] display percentage.
pub fn confidence_from_distance(distance: f32) -> f32 {
    (100.0 - distance * 100.0).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 1.0, landmarks: None }
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.6, 0.8, 0.0]);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_euclidean_distance_orthogonal_unit() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!((a.euclidean_distance(&b) - 2f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_single_axis_is_exact() {
        let a = Embedding::new(vec![0.0, 0.0, 0.0]);
        let b = Embedding::new(vec![0.7, 0.0, 0.0]);
        assert_eq!(a.euclidean_distance(&b), 0.7);
    }

    #[test]
    fn test_is_finite() {
        assert!(Embedding::new(vec![0.0, -1.5]).is_finite());
        assert!(!Embedding::new(vec![0.0, f32::NAN]).is_finite());
        assert!(!Embedding::new(vec![f32::INFINITY]).is_finite());
    }

    #[test]
    fn test_confidence_mapping() {
        assert_eq!(confidence_from_distance(0.0), 100.0);
        assert!((confidence_from_distance(0.69) - 31.0).abs() < 1e-3);
        assert_eq!(confidence_from_distance(1.0), 0.0);
        assert_eq!(confidence_from_distance(1.4), 0.0);
    }

    #[test]
    fn test_bbox_area() {
        assert_eq!(make_bbox(0.0, 0.0, 10.0, 40.0).area(), 400.0);
        assert_eq!(make_bbox(0.0, 0.0, -5.0, 40.0).area(), 0.0);
    }

    #[test]
    fn test_iou_identical() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0);
        let b = make_bbox(20.0, 20.0, 10.0, 10.0);
        assert!(a.iou(&b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0);
        let b = make_bbox(5.0, 0.0, 10.0, 10.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }
}
