//! Image preprocessing shared by training and verification.
//!
//! Both paths go through [`fill_slot`], so the tensor a model is trained on
//! and the tensor it is asked to score are produced by the same code.

use crate::types::InputShape;
use image::error::{ParameterError, ParameterErrorKind};
use image::imageops::{self, FilterType};
use image::{ImageError, RgbImage};
use ndarray::{Array4, ArrayViewMut3, Axis};
use serde::{Deserialize, Serialize};

// VGGFace v1 channel means, in BGR order.
const VGGFACE_MEAN_BGR: [f32; 3] = [93.5940, 104.7624, 129.1863];
const SYMMETRIC_MEAN: f32 = 127.5;
const SYMMETRIC_STD: f32 = 127.5;

/// Pixel normalization applied after resizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// RGB→BGR, then subtract the VGGFace v1 channel means.
    VggFace,
    /// `(p − 127.5) / 127.5` per channel, RGB order.
    Symmetric,
}

impl Normalization {
    /// Normalize one RGB pixel into three planar channel values.
    fn apply(self, [r, g, b]: [u8; 3]) -> [f32; 3] {
        match self {
            Normalization::VggFace => [
                b as f32 - VGGFACE_MEAN_BGR[0],
                g as f32 - VGGFACE_MEAN_BGR[1],
                r as f32 - VGGFACE_MEAN_BGR[2],
            ],
            Normalization::Symmetric => [
                (r as f32 - SYMMETRIC_MEAN) / SYMMETRIC_STD,
                (g as f32 - SYMMETRIC_MEAN) / SYMMETRIC_STD,
                (b as f32 - SYMMETRIC_MEAN) / SYMMETRIC_STD,
            ],
        }
    }
}

/// Decode encoded image bytes (PNG, JPEG, ...) into RGB. Images with a zero
/// dimension are rejected.
pub fn decode(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    let img = image::load_from_memory(bytes)?.to_rgb8();
    if img.width() == 0 || img.height() == 0 {
        return Err(ImageError::Parameter(ParameterError::from_kind(
            ParameterErrorKind::Generic(format!(
                "empty image ({}x{})",
                img.width(),
                img.height()
            )),
        )));
    }
    Ok(img)
}

/// Resize to the classifier input, `width × height`.
pub fn resize(img: &RgbImage, shape: InputShape) -> RgbImage {
    if img.width() == shape.width && img.height() == shape.height {
        return img.clone();
    }
    imageops::resize(img, shape.width, shape.height, FilterType::Triangle)
}

/// Resize and normalize `img` into one `(3, H, W)` slot of a batch tensor.
pub fn fill_slot(
    mut slot: ArrayViewMut3<f32>,
    img: &RgbImage,
    shape: InputShape,
    norm: Normalization,
) {
    let resized = resize(img, shape);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let [c0, c1, c2] = norm.apply(pixel.0);
        let (x, y) = (x as usize, y as usize);
        slot[[0, y, x]] = c0;
        slot[[1, y, x]] = c1;
        slot[[2, y, x]] = c2;
    }
}

/// Preprocess a single image into a `(1, 3, H, W)` tensor.
pub fn to_tensor(img: &RgbImage, shape: InputShape, norm: Normalization) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((
        1,
        InputShape::CHANNELS,
        shape.height as usize,
        shape.width as usize,
    ));
    fill_slot(tensor.index_axis_mut(Axis(0), 0), img, shape, norm);
    tensor
}
