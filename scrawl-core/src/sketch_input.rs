use image::DynamicImage;

use crate::error::StudioError;

/// Raw pixel buffer handed over by canvas front ends. The channel count is
/// inferred from the buffer length.
#[derive(Debug, Clone)]
pub struct RawPixels {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum SketchLayer {
    Image(DynamicImage),
    Raw(RawPixels),
}

/// Layered payload as drawing widgets emit it. The drawn layer wins over the
/// flattened composite when both are present.
#[derive(Debug, Clone, Default)]
pub struct CanvasPayload {
    pub image: Option<SketchLayer>,
    pub composite: Option<SketchLayer>,
}

#[derive(Debug, Clone)]
pub enum SketchInput {
    Image(DynamicImage),
    Raw(RawPixels),
    Canvas(CanvasPayload),
}

/// Reduces whatever the front end sent into the RGB line art the generation
/// pipeline consumes. Strokes are flattened to grayscale first so colored pens
/// condition the model the same way a pencil would.
pub fn normalize_sketch(input: Option<SketchInput>) -> Result<DynamicImage, StudioError> {
    let input = input.ok_or(StudioError::EmptySketch)?;

    let layer = match input {
        SketchInput::Image(image) => SketchLayer::Image(image),
        SketchInput::Raw(raw) => SketchLayer::Raw(raw),
        SketchInput::Canvas(payload) => payload
            .image
            .or(payload.composite)
            .ok_or(StudioError::InvalidSketchFormat)?,
    };

    let image = match layer {
        SketchLayer::Image(image) => image,
        SketchLayer::Raw(raw) => decode_raw(raw)?,
    };

    Ok(DynamicImage::ImageRgb8(image.grayscale().to_rgb8()))
}

fn decode_raw(raw: RawPixels) -> Result<DynamicImage, StudioError> {
    let RawPixels {
        width,
        height,
        pixels,
    } = raw;
    let area = width as usize * height as usize;
    if area == 0 || pixels.is_empty() || pixels.len() % area != 0 {
        return Err(StudioError::InvalidSketchFormat);
    }

    match pixels.len() / area {
        1 => image::GrayImage::from_raw(width, height, pixels)
            .map(DynamicImage::ImageLuma8)
            .ok_or(StudioError::InvalidSketchFormat),
        3 => image::RgbImage::from_raw(width, height, pixels)
            .map(DynamicImage::ImageRgb8)
            .ok_or(StudioError::InvalidSketchFormat),
        4 => image::RgbaImage::from_raw(width, height, pixels)
            .map(DynamicImage::ImageRgba8)
            .ok_or(StudioError::InvalidSketchFormat),
        _ => Err(StudioError::InvalidSketchFormat),
    }
}

/// Idempotent RGB coercion applied before images reach a pipeline.
pub fn ensure_rgb(image: DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageRgb8(_) => image,
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}

pub fn validate_present<'a>(
    image: Option<&'a DynamicImage>,
    label: &str,
) -> Result<&'a DynamicImage, StudioError> {
    image.ok_or_else(|| StudioError::MissingImage {
        label: label.to_string(),
    })
}
