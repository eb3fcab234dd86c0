//! Raw image input and conversion to the grayscale image the extractor runs on.

use image::{GrayImage, Luma};

use crate::error::SlamError;

/// A raw 8-bit image buffer in row-major order.
///
/// `shape` is `[height, width]` for single-channel data or
/// `[height, width, channels]` with interleaved channels. Three-channel data
/// is BGR, four-channel data is BGRA.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub data: Vec<u8>,
    pub shape: Vec<usize>,
}

impl ImageInput {
    pub fn new(data: Vec<u8>, shape: Vec<usize>) -> Self {
        Self { data, shape }
    }

    /// Single-channel image of the given size.
    pub fn gray(width: usize, height: usize, data: Vec<u8>) -> Self {
        Self {
            data,
            shape: vec![height, width],
        }
    }

    /// Interleaved BGR image of the given size.
    pub fn bgr(width: usize, height: usize, data: Vec<u8>) -> Self {
        Self {
            data,
            shape: vec![height, width, 3],
        }
    }

    pub fn from_gray_image(img: &GrayImage) -> Self {
        Self::gray(img.width() as usize, img.height() as usize, img.as_raw().clone())
    }
}

fn invalid(reason: impl Into<String>) -> SlamError {
    SlamError::InvalidImageFormat {
        reason: reason.into(),
    }
}

/// Validate the input and convert it to a grayscale image.
///
/// Color is reduced with the Rec. 601 luma weights.
pub fn preprocess(input: &ImageInput) -> Result<GrayImage, SlamError> {
    let (height, width, channels) = match input.shape.as_slice() {
        [h, w] => (*h, *w, 1),
        [h, w, c] => (*h, *w, *c),
        other => return Err(invalid(format!("expected 2 or 3 dimensions, got {}", other.len()))),
    };
    if height == 0 || width == 0 {
        return Err(invalid(format!("zero-sized image {width}x{height}")));
    }
    if !matches!(channels, 1 | 3 | 4) {
        return Err(invalid(format!("unsupported channel count {channels}")));
    }
    let expected = height
        .checked_mul(width)
        .and_then(|n| n.checked_mul(channels))
        .ok_or_else(|| invalid("image dimensions overflow"))?;
    if input.data.len() != expected {
        return Err(invalid(format!(
            "buffer holds {} bytes, shape needs {}",
            input.data.len(),
            expected
        )));
    }
    let (w, h) = (
        u32::try_from(width).map_err(|_| invalid("width too large"))?,
        u32::try_from(height).map_err(|_| invalid("height too large"))?,
    );

    let gray = if channels == 1 {
        GrayImage::from_raw(w, h, input.data.clone())
    } else {
        let mut img = GrayImage::new(w, h);
        for (px, chunk) in img.pixels_mut().zip(input.data.chunks_exact(channels)) {
            let (b, g, r) = (chunk[0] as f32, chunk[1] as f32, chunk[2] as f32);
            *px = Luma([(0.299 * r + 0.587 * g + 0.114 * b).round().min(255.0) as u8]);
        }
        Some(img)
    };
    gray.ok_or_else(|| invalid("buffer does not match dimensions"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gray_passthrough() {
        let input = ImageInput::gray(4, 3, (0..12).collect());
        let img = preprocess(&input).unwrap();
        assert_eq!(img.dimensions(), (4, 3));
        assert_eq!(img.get_pixel(1, 2)[0], 9);
    }

    #[test]
    fn test_bgr_to_luma() {
        // Pure red pixel in BGR order.
        let input = ImageInput::bgr(1, 1, vec![0, 0, 255]);
        let img = preprocess(&input).unwrap();
        assert_eq!(img.get_pixel(0, 0)[0], 76);
    }

    #[test]
    fn test_single_channel_3d_shape() {
        let input = ImageInput::new(vec![7; 6], vec![2, 3, 1]);
        assert_eq!(preprocess(&input).unwrap().dimensions(), (3, 2));
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let cases = [
            ImageInput::new(vec![0; 8], vec![8]),
            ImageInput::new(vec![0; 8], vec![2, 2, 2, 1]),
            ImageInput::new(vec![], vec![0, 5]),
            ImageInput::new(vec![0; 10], vec![5, 1, 2]),
            ImageInput::new(vec![0; 5], vec![2, 3]),
        ];
        for input in &cases {
            assert!(
                matches!(preprocess(input), Err(SlamError::InvalidImageFormat { .. })),
                "shape {:?} accepted",
                input.shape
            );
        }
    }
}
