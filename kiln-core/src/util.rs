use std::io::Cursor;

use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use image::DynamicImage;
use tracing::info;

use crate::error::{Error, Result};

pub(crate) fn select_device(force_cpu: bool) -> candle_core::Result<Device> {
    if force_cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        info!("no accelerator available, running on CPU");
        Ok(Device::Cpu)
    }
}

/// Converts a tensor with shape (3, height, width) into an image.
pub(crate) fn tensor_to_image(img: &Tensor) -> candle_core::Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        candle_core::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels).ok_or_else(
        || candle_core::Error::Msg("error converting tensor to image buffer".to_string()),
    )?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Encodes an image as PNG bytes.
pub(crate) fn image_to_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|err| Error::EngineFailure(format!("png encoding failed: {err}")))?;
    Ok(png)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_to_image_keeps_dimensions() {
        let tensor = Tensor::from_vec(vec![0u8; 3 * 2 * 4], (3, 2, 4), &Device::Cpu).unwrap();
        let image = tensor_to_image(&tensor).unwrap();
        assert_eq!((image.width(), image.height()), (4, 2));

        let wrong = Tensor::from_vec(vec![0u8; 4], (1, 2, 2), &Device::Cpu).unwrap();
        assert!(tensor_to_image(&wrong).is_err());
    }

    #[test]
    fn png_encoding_starts_with_the_signature() {
        let image = DynamicImage::ImageRgb8(image::RgbImage::new(2, 2));
        let png = image_to_png(&image).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }
}
