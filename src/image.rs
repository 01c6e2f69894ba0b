use crate::{
    api::{DetectionBox, ResultBundle},
    region::CropRectangle,
};
use anyhow::{Context, bail};
use image::{ImageBuffer, RgbImage};
use jpeg_encoder::{ColorType, Encoder};
use std::{fmt, path::Path, time::Instant};
use tracing::{debug, info};
use zune_core::{colorspace::ColorSpace, options::DecoderOptions};
use zune_jpeg::JpegDecoder;

const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// Packed RGB8 image.
#[derive(Clone, Default, PartialEq)]
pub struct Image {
    pub name: Option<String>,
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl Image {
    pub fn new(
        name: Option<String>,
        width: usize,
        height: usize,
        pixels: Vec<u8>,
    ) -> anyhow::Result<Self> {
        if pixels.len() != width * height * 3 {
            bail!(
                "Pixel buffer of {} bytes does not match {}x{} RGB image",
                pixels.len(),
                width,
                height
            );
        }
        Ok(Self {
            name,
            width,
            height,
            pixels,
        })
    }

    pub fn resize(&mut self, size: usize) {
        self.pixels.resize(size, 0);
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Copies the part of the image covered by `rect`. The rectangle is clipped to
    /// the image first and `None` is returned when nothing is left.
    pub fn crop(&self, rect: &CropRectangle) -> Option<Image> {
        let clipped = rect.clip(self.width, self.height)?;
        let left = clipped.left as usize;
        let right = clipped.right as usize;
        let top = clipped.top as usize;
        let bottom = clipped.bottom as usize;
        let width = right - left;
        let height = bottom - top;

        let mut pixels = Vec::with_capacity(width * height * 3);
        for row in top..bottom {
            let start = (row * self.width + left) * 3;
            pixels.extend_from_slice(&self.pixels[start..start + width * 3]);
        }

        Some(Image {
            name: self.name.clone(),
            width,
            height,
            pixels,
        })
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Image({self})")
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}, Resolution: {}x{}",
            self.name, self.width, self.height
        )
    }
}

pub fn decode_jpeg(name: Option<String>, jpeg: &[u8], image: &mut Image) -> anyhow::Result<()> {
    let options = DecoderOptions::default()
        .set_strict_mode(true)
        .jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(jpeg, options);
    // We need to decode the headers first to get the output buffer size
    decoder.decode_headers()?;
    let output_buffer_size = decoder
        .output_buffer_size()
        .ok_or_else(|| anyhow::anyhow!("Failed to get decoder output buffer size"))?;
    image.resize(output_buffer_size);
    decoder.decode_into(&mut image.pixels)?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| anyhow::anyhow!("Failed to get image dimensions"))?;
    image.width = width;
    image.height = height;
    image.name = name;
    Ok(())
}

/// Decodes any supported upload into RGB. JPEG goes through zune-jpeg, everything
/// else through the `image` crate.
pub fn decode_image(name: Option<String>, data: &[u8]) -> anyhow::Result<Image> {
    let decode_start_time = Instant::now();
    let mut image = Image::default();
    if data.starts_with(&JPEG_MAGIC) {
        decode_jpeg(name, data, &mut image)?;
    } else {
        let decoded = image::load_from_memory(data)
            .context("Unsupported or corrupt image data")?
            .to_rgb8();
        image = Image::new(
            name,
            decoded.width() as usize,
            decoded.height() as usize,
            decoded.into_raw(),
        )?;
    }
    if image.is_empty() {
        bail!("Decoded image has no pixels");
    }
    debug!(
        "Decode image time: {:?}, resolution {}x{}",
        decode_start_time.elapsed(),
        image.width,
        image.height
    );
    Ok(image)
}

pub fn encode_jpeg(image: &Image, quality: u8) -> anyhow::Result<Vec<u8>> {
    let width = u16::try_from(image.width).context("Image too wide for JPEG")?;
    let height = u16::try_from(image.height).context("Image too tall for JPEG")?;
    let mut buffer = Vec::with_capacity(image.pixels.len() / 4);
    let encoder = Encoder::new(&mut buffer, quality);
    encoder.encode(&image.pixels, width, height, ColorType::Rgb)?;
    Ok(buffer)
}

pub fn create_random_jpeg_name() -> String {
    format!("image_{}.jpg", uuid::Uuid::new_v4())
}

/// Derives `<stem>_fused.jpg` from an image name, dropping any directory part.
pub fn create_fused_image_name(image_name: &str) -> anyhow::Result<String> {
    let file_name = Path::new(image_name)
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Failed to strip path from image name"))?
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Failed to convert image name to string"))?;

    let stem = match file_name.rfind('.') {
        Some(0) | None => file_name,
        Some(pos) => &file_name[..pos],
    };
    if stem.is_empty() {
        bail!("Failed to get image stem");
    }
    Ok(format!("{stem}_fused.jpg"))
}

/// Draws vehicle boxes in red and plate boxes in green.
pub fn draw_result_bundle(image: &Image, bundle: &ResultBundle) -> anyhow::Result<RgbImage> {
    let mut img: RgbImage = ImageBuffer::from_vec(
        image.width as u32,
        image.height as u32,
        image.pixels.clone(),
    )
    .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))?;

    for vehicle in &bundle.vehicles {
        let rect = CropRectangle::from_center_size(
            vehicle.bbox.x,
            vehicle.bbox.y,
            vehicle.bbox.width,
            vehicle.bbox.height,
        );
        draw_rect(&mut img, rect.left, rect.top, rect.right, rect.bottom, [255, 0, 0]);

        // Plate boxes from crops are relative to the crop origin.
        if let Some(plate) = vehicle.detection_bbox.as_ref() {
            let origin_x = rect.left.max(0);
            let origin_y = rect.top.max(0);
            draw_plate(&mut img, plate, origin_x, origin_y);
        }
    }
    for plate in &bundle.plates {
        draw_plate(&mut img, &plate.detection_bbox, 0, 0);
    }
    Ok(img)
}

fn draw_plate(img: &mut RgbImage, plate: &DetectionBox, origin_x: i64, origin_y: i64) {
    draw_rect(
        img,
        origin_x + plate.xmin,
        origin_y + plate.ymin,
        origin_x + plate.xmax,
        origin_y + plate.ymax,
        [0, 255, 0],
    );
}

fn draw_rect(img: &mut RgbImage, left: i64, top: i64, right: i64, bottom: i64, color: [u8; 3]) {
    let dx = right - left;
    let dy = bottom - top;
    if dx > 0 && dy > 0 {
        imageproc::drawing::draw_hollow_rect_mut(
            img,
            imageproc::rect::Rect::at(left as i32, top as i32).of_size(dx as u32, dy as u32),
            image::Rgb(color),
        );
    }
}

pub fn save_result_bundle_jpeg(
    image: &Image,
    bundle: &ResultBundle,
    jpeg_file: &Path,
) -> anyhow::Result<()> {
    let encode_image_start_time = Instant::now();
    let img = draw_result_bundle(image, bundle)?;
    let width = u16::try_from(img.width()).context("Image too wide for JPEG")?;
    let height = u16::try_from(img.height()).context("Image too tall for JPEG")?;

    let encoder = Encoder::new_file(jpeg_file, 90)?;
    encoder.encode(img.as_raw(), width, height, ColorType::Rgb)?;
    debug!(encode_image_time = ?encode_image_start_time.elapsed(), "Encode image time");
    info!(?jpeg_file, "Image saved");
    Ok(())
}

pub struct Resizer {
    resizer: fast_image_resize::Resizer,
    target_width: usize,
    target_height: usize,
}

impl Default for Resizer {
    fn default() -> Self {
        Self {
            resizer: fast_image_resize::Resizer::new(),
            target_width: 640,
            target_height: 640,
        }
    }
}

impl Resizer {
    pub fn resize_image(
        &mut self,
        original_image: &Image,
        resized_image: &mut Image,
    ) -> anyhow::Result<()> {
        debug!(
            "Resizing image from {}x{} to {}x{}",
            original_image.width, original_image.height, self.target_width, self.target_height
        );
        let src_image = fast_image_resize::images::ImageRef::new(
            original_image.width as u32,
            original_image.height as u32,
            &original_image.pixels,
            fast_image_resize::PixelType::U8x3,
        )?;

        resized_image.width = self.target_width;
        resized_image.height = self.target_height;
        resized_image.resize(self.target_width * self.target_height * 3);

        let mut dst_image = fast_image_resize::images::Image::from_slice_u8(
            resized_image.width as u32,
            resized_image.height as u32,
            &mut resized_image.pixels,
            fast_image_resize::PixelType::U8x3,
        )?;

        self.resizer.resize(&src_image, &mut dst_image, None)?;

        Ok(())
    }
}
