use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, IndexOp, Tensor};
use image::DynamicImage;
use tracing::warn;

use crate::DeviceMap;

pub fn select_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                warn!("running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                warn!("running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Converts an image into a (1, 3, height, width) tensor scaled to [-1, 1],
/// resizing to the requested shape first. The tensor lives on the CPU; callers
/// move it to their device.
pub fn image_to_tensor(image: &DynamicImage, width: usize, height: usize) -> Result<Tensor> {
    let resized = image.resize_exact(
        width as u32,
        height as u32,
        image::imageops::FilterType::CatmullRom,
    );
    let data = resized.to_rgb8().into_raw();
    let tensor = Tensor::from_vec(data, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor)
}

/// Converts a decoded (1, 3, height, width) tensor in [-1, 1] back into an image.
pub fn decoded_to_image(decoded: &Tensor) -> Result<DynamicImage> {
    let pixels = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
    tensor_to_image(&pixels.i(0)?)
}

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn force_cpu_always_selects_cpu() {
        let device = select_device(DeviceMap::ForceCpu).unwrap();
        assert!(matches!(device, Device::Cpu));
    }

    #[test]
    fn ordinal_selection_falls_back_cleanly() {
        assert!(select_device(DeviceMap::Ordinal(0)).is_ok());
    }

    #[test]
    fn image_round_trips_through_tensor() {
        let mut source = RgbImage::new(2, 2);
        source.put_pixel(0, 0, Rgb([255, 0, 0]));
        source.put_pixel(1, 0, Rgb([0, 255, 0]));
        source.put_pixel(0, 1, Rgb([0, 0, 255]));
        source.put_pixel(1, 1, Rgb([255, 255, 255]));
        let source = DynamicImage::ImageRgb8(source);

        let tensor = image_to_tensor(&source, 2, 2).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 2, 2]);

        let restored = decoded_to_image(&tensor).unwrap();
        assert_eq!(restored.to_rgb8().into_raw(), source.to_rgb8().into_raw());
    }

    #[test]
    fn resizes_to_requested_shape() {
        let source = DynamicImage::ImageRgb8(RgbImage::from_pixel(7, 5, Rgb([10, 20, 30])));
        let tensor = image_to_tensor(&source, 4, 4).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 4, 4]);
    }

    #[test]
    fn rejects_non_rgb_tensor_shapes() {
        let tensor = Tensor::zeros((4, 2, 2), DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&tensor).is_err());
    }

    #[test]
    fn decoded_values_clamp_to_pixel_range() {
        let hot = Tensor::full(5f32, (1, 3, 2, 2), &Device::Cpu).unwrap();
        let image = decoded_to_image(&hot).unwrap().to_rgb8();
        assert!(image.pixels().all(|p| p.0 == [255, 255, 255]));

        let cold = Tensor::full(-5f32, (1, 3, 2, 2), &Device::Cpu).unwrap();
        let image = decoded_to_image(&cold).unwrap().to_rgb8();
        assert!(image.pixels().all(|p| p.0 == [0, 0, 0]));
    }
}
