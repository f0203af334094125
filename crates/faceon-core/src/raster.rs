//! Owned 8-bit interleaved images and the handful of whole-image operations
//! the pipeline needs (crop, region write-back, resize, mirror, BGRA).
//!
//! Frames are BGR (3 channels), masks are single-channel, and sink frames are
//! BGRA. The raster never interprets channel order itself.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Pixel, Rgb, Rgba};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RasterError {
    #[error("buffer length {actual} does not match {width}x{height}x{channels} = {expected}")]
    Dimensions {
        width: u32,
        height: u32,
        channels: u8,
        expected: usize,
        actual: usize,
    },
    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(u8),
}

/// Axis-aligned integer rectangle inside a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// An owned, row-major, interleaved 8-bit image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Raster {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
}

impl Raster {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8) -> Result<Self, RasterError> {
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(RasterError::Dimensions {
                width,
                height,
                channels,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            channels,
        })
    }

    /// A raster with every byte set to `value`.
    pub fn filled(width: u32, height: u32, channels: u8, value: u8) -> Self {
        Self {
            data: vec![value; width as usize * height as usize * channels as usize],
            width,
            height,
            channels,
        }
    }

    pub fn zeroed(width: u32, height: u32, channels: u8) -> Self {
        Self::filled(width, height, channels, 0)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    /// Row stride in bytes.
    pub fn stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    pub fn bounds(&self) -> Rect {
        Rect {
            x: 0,
            y: 0,
            width: self.width,
            height: self.height,
        }
    }

    /// Byte slice for the pixel at (x, y).
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let c = self.channels as usize;
        let idx = (y as usize * self.width as usize + x as usize) * c;
        &self.data[idx..idx + c]
    }

    /// Copy a sub-rectangle out. `rect` must lie inside the raster.
    pub fn crop(&self, rect: Rect) -> Raster {
        let c = self.channels as usize;
        let row_len = rect.width as usize * c;
        let mut out = Vec::with_capacity(row_len * rect.height as usize);
        for row in 0..rect.height as usize {
            let start = ((rect.y as usize + row) * self.width as usize + rect.x as usize) * c;
            out.extend_from_slice(&self.data[start..start + row_len]);
        }
        Raster {
            data: out,
            width: rect.width,
            height: rect.height,
            channels: self.channels,
        }
    }

    /// Write `patch` back at the origin of `rect`. Channel counts must match.
    pub fn write_region(&mut self, rect: Rect, patch: &Raster) {
        debug_assert_eq!(self.channels, patch.channels);
        debug_assert_eq!((rect.width, rect.height), (patch.width, patch.height));
        let c = self.channels as usize;
        let row_len = rect.width as usize * c;
        for row in 0..rect.height as usize {
            let dst = ((rect.y as usize + row) * self.width as usize + rect.x as usize) * c;
            let src = row * row_len;
            self.data[dst..dst + row_len].copy_from_slice(&patch.data[src..src + row_len]);
        }
    }

    /// Mirror left-to-right in place.
    pub fn flip_horizontal(&mut self) {
        let c = self.channels as usize;
        let stride = self.stride();
        let w = self.width as usize;
        for row in self.data.chunks_exact_mut(stride) {
            for x in 0..w / 2 {
                let (l, r) = (x * c, (w - 1 - x) * c);
                for k in 0..c {
                    row.swap(l + k, r + k);
                }
            }
        }
    }

    /// Resample to `width`×`height` with the given filter.
    pub fn resized(&self, width: u32, height: u32, filter: FilterType) -> Result<Raster, RasterError> {
        if width == self.width && height == self.height {
            return Ok(self.clone());
        }
        let data = match self.channels {
            1 => resize_as::<Luma<u8>>(self, width, height, filter),
            3 => resize_as::<Rgb<u8>>(self, width, height, filter),
            4 => resize_as::<Rgba<u8>>(self, width, height, filter),
            other => return Err(RasterError::UnsupportedChannels(other)),
        }?;
        Raster::new(data, width, height, self.channels)
    }

    /// BGR → BGRA with opaque alpha.
    pub fn to_bgra(&self) -> Result<Raster, RasterError> {
        if self.channels != 3 {
            return Err(RasterError::UnsupportedChannels(self.channels));
        }
        let mut out = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        for px in self.data.chunks_exact(3) {
            out.extend_from_slice(&[px[0], px[1], px[2], 255]);
        }
        Raster::new(out, self.width, self.height, 4)
    }

    /// Reverse the order of the first three channels (BGR ↔ RGB).
    pub fn swap_red_blue(&mut self) {
        if self.channels < 3 {
            return;
        }
        for px in self.data.chunks_exact_mut(self.channels as usize) {
            px.swap(0, 2);
        }
    }

    /// Build a BGR raster from an RGB image buffer.
    pub fn from_rgb_image(img: image::RgbImage) -> Raster {
        let (width, height) = img.dimensions();
        let mut raster = Raster {
            data: img.into_raw(),
            width,
            height,
            channels: 3,
        };
        raster.swap_red_blue();
        raster
    }

    /// Convert a BGR raster into an RGB image buffer.
    pub fn to_rgb_image(&self) -> Option<image::RgbImage> {
        if self.channels != 3 {
            return None;
        }
        let mut copy = self.clone();
        copy.swap_red_blue();
        image::RgbImage::from_raw(self.width, self.height, copy.data)
    }
}

fn resize_as<P>(src: &Raster, width: u32, height: u32, filter: FilterType) -> Result<Vec<u8>, RasterError>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let view = ImageBuffer::<P, &[u8]>::from_raw(src.width, src.height, src.data.as_slice()).ok_or(
        RasterError::Dimensions {
            width: src.width,
            height: src.height,
            channels: src.channels,
            expected: src.width as usize * src.height as usize * src.channels as usize,
            actual: src.data.len(),
        },
    )?;
    Ok(imageops::resize(&view, width, height, filter).into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_wrong_length() {
        let err = Raster::new(vec![0u8; 10], 2, 2, 3).unwrap_err();
        assert!(matches!(err, RasterError::Dimensions { expected: 12, actual: 10, .. }));
    }

    #[test]
    fn test_crop_and_write_back() {
        let data: Vec<u8> = (0..16).collect();
        let mut r = Raster::new(data, 4, 4, 1).unwrap();
        let rect = Rect { x: 1, y: 1, width: 2, height: 2 };
        let patch = r.crop(rect);
        assert_eq!(patch.data(), &[5, 6, 9, 10]);

        let zeros = Raster::zeroed(2, 2, 1);
        r.write_region(rect, &zeros);
        assert_eq!(r.pixel(1, 1), &[0]);
        assert_eq!(r.pixel(2, 2), &[0]);
        assert_eq!(r.pixel(0, 0), &[0]);
        assert_eq!(r.pixel(3, 3), &[15]);
        assert_eq!(r.pixel(3, 1), &[7]);
    }

    #[test]
    fn test_flip_horizontal_three_channels() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9];
        let mut r = Raster::new(data, 3, 1, 3).unwrap();
        r.flip_horizontal();
        assert_eq!(r.data(), &[7, 8, 9, 4, 5, 6, 1, 2, 3]);
    }

    #[test]
    fn test_resize_uniform_stays_uniform() {
        let r = Raster::filled(40, 30, 3, 77);
        let out = r.resized(64, 48, FilterType::Triangle).unwrap();
        assert_eq!((out.width(), out.height(), out.channels()), (64, 48, 3));
        assert!(out.data().iter().all(|&v| v == 77));
    }

    #[test]
    fn test_to_bgra_appends_opaque_alpha() {
        let r = Raster::new(vec![10, 20, 30], 1, 1, 3).unwrap();
        let bgra = r.to_bgra().unwrap();
        assert_eq!(bgra.data(), &[10, 20, 30, 255]);
    }

    #[test]
    fn test_rgb_image_roundtrip_swaps_channels() {
        let img = image::RgbImage::from_raw(1, 1, vec![200, 100, 50]).unwrap();
        let bgr = Raster::from_rgb_image(img);
        assert_eq!(bgr.data(), &[50, 100, 200]);
        let back = bgr.to_rgb_image().unwrap();
        assert_eq!(back.into_raw(), vec![200, 100, 50]);
    }
}
