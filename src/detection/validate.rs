use image::DynamicImage;
use thiserror::Error;

pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("image size exceeds {}MB limit", .limit / (1024 * 1024))]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("invalid image format: {0}")]
    InvalidImage(String),
}

/// Size and format gate applied to uploaded bytes before inference.
#[derive(Debug, Clone, Copy)]
pub struct ImageValidator {
    max_bytes: usize,
}

impl Default for ImageValidator {
    fn default() -> Self {
        Self::new(MAX_IMAGE_BYTES)
    }
}

impl ImageValidator {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn check_size(&self, data: &[u8]) -> Result<(), ValidationError> {
        if data.len() > self.max_bytes {
            return Err(ValidationError::PayloadTooLarge {
                size: data.len(),
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    /// Size check first, then decode. Oversized input is never decoded.
    pub fn decode(&self, data: &[u8]) -> Result<DynamicImage, ValidationError> {
        self.check_size(data)?;
        image::load_from_memory(data).map_err(|e| {
            tracing::debug!(error = %e, size = data.len(), "image decode failed");
            ValidationError::InvalidImage(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::testing::sample_jpeg;

    #[test]
    fn six_mib_is_rejected_regardless_of_content() {
        let validator = ImageValidator::default();
        let data = vec![0xFFu8; 6 * 1024 * 1024];

        let err = validator.decode(&data).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::PayloadTooLarge { size, limit }
                if size == 6 * 1024 * 1024 && limit == MAX_IMAGE_BYTES
        ));
        assert_eq!(err.to_string(), "image size exceeds 5MB limit");
    }

    #[test]
    fn exactly_at_limit_passes_size_check() {
        let validator = ImageValidator::new(1024);
        assert!(validator.check_size(&[0u8; 1024]).is_ok());
        assert!(validator.check_size(&[0u8; 1025]).is_err());
    }

    #[test]
    fn small_jpeg_decodes() {
        let jpeg = sample_jpeg(48, 32);
        assert!(jpeg.len() < 4 * 1024);

        let image = ImageValidator::default().decode(&jpeg).unwrap();
        assert_eq!(image.width(), 48);
        assert_eq!(image.height(), 32);
    }

    #[test]
    fn garbage_is_invalid_image() {
        let err = ImageValidator::default()
            .decode(b"definitely not an image")
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidImage(_)));
    }
}
