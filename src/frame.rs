// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - RGB 图像与 NCHW 张量之间的转换
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use ndarray::Array3;

const RGB_CHANNELS: usize = 3;

/// (C, H, W) 排列的浮点 RGB 帧，取值默认位于 [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct RgbNchwFrame {
  data: Array3<f32>,
}

impl RgbNchwFrame {
  pub fn with_shape(height: usize, width: usize) -> Self {
    Self {
      data: Array3::zeros((RGB_CHANNELS, height, width)),
    }
  }

  pub fn height(&self) -> usize {
    self.data.dim().1
  }

  pub fn width(&self) -> usize {
    self.data.dim().2
  }

  pub fn channels(&self) -> usize {
    self.data.dim().0
  }

  pub fn as_array(&self) -> &Array3<f32> {
    &self.data
  }

  pub fn into_array(self) -> Array3<f32> {
    self.data
  }
}

impl From<Array3<f32>> for RgbNchwFrame {
  fn from(data: Array3<f32>) -> Self {
    Self { data }
  }
}

impl AsRef<Array3<f32>> for RgbNchwFrame {
  fn as_ref(&self) -> &Array3<f32> {
    &self.data
  }
}

fn to_u8(value: f32, lo: f32, hi: f32) -> u8 {
  let scaled = (value - lo) / (hi - lo) * 255.0;
  if scaled.is_nan() {
    0
  } else {
    scaled.round().clamp(0.0, 255.0) as u8
  }
}

#[cfg(feature = "image")]
mod rgb {
  use image::{Rgb, RgbImage};

  use super::{RGB_CHANNELS, RgbNchwFrame, to_u8};
  use ndarray::Array3;

  impl From<&RgbImage> for RgbNchwFrame {
    fn from(image: &RgbImage) -> Self {
      let (width, height) = image.dimensions();
      let data = Array3::from_shape_fn(
        (RGB_CHANNELS, height as usize, width as usize),
        |(c, h, w)| image.get_pixel(w as u32, h as u32)[c] as f32 / 255.0,
      );
      RgbNchwFrame { data }
    }
  }

  impl From<RgbImage> for RgbNchwFrame {
    fn from(image: RgbImage) -> Self {
      RgbNchwFrame::from(&image)
    }
  }

  impl RgbNchwFrame {
    /// 按取值范围线性映射到 0..=255，超出范围的值被截断
    pub fn to_rgb_image(&self, valid_range: [f32; 2]) -> RgbImage {
      let [lo, hi] = valid_range;
      let (_, height, width) = self.data.dim();
      RgbImage::from_fn(width as u32, height as u32, |w, h| {
        let (h, w) = (h as usize, w as usize);
        let channel = |c: usize| {
          let c = c.min(self.channels().saturating_sub(1));
          to_u8(self.data[[c, h, w]], lo, hi)
        };
        Rgb([channel(0), channel(1), channel(2)])
      })
    }
  }

  /// 扰动可视化：0 映射为灰色 128，±ε 映射到两端
  pub fn perturbation_image(perturbation: &Array3<f32>, epsilon: f32) -> RgbImage {
    let bound = if epsilon > 0.0 { epsilon } else { 1.0 };
    let frame = RgbNchwFrame::from(perturbation.clone());
    frame.to_rgb_image([-bound, bound])
  }
}

#[cfg(feature = "image")]
pub use self::rgb::perturbation_image;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn shape_accessors() {
    let frame = RgbNchwFrame::with_shape(4, 6);
    assert_eq!(
      (frame.channels(), frame.height(), frame.width()),
      (3, 4, 6)
    );
  }

  #[test]
  fn values_are_clamped_when_quantized() {
    assert_eq!(to_u8(-0.5, 0.0, 1.0), 0);
    assert_eq!(to_u8(2.0, 0.0, 1.0), 255);
    assert_eq!(to_u8(0.5, 0.0, 1.0), 128);
    assert_eq!(to_u8(f32::NAN, 0.0, 1.0), 0);
  }

  #[cfg(feature = "image")]
  #[test]
  fn rgb_image_round_trips_through_the_tensor() {
    let image = image::RgbImage::from_fn(5, 3, |x, y| image::Rgb([x as u8 * 40, y as u8 * 60, 7]));
    let frame = RgbNchwFrame::from(&image);
    assert_eq!(frame.as_array().dim(), (3, 3, 5));
    assert_eq!(frame.as_array()[[0, 1, 2]], 80.0 / 255.0);
    assert_eq!(frame.to_rgb_image([0.0, 1.0]), image);
  }

  #[cfg(feature = "image")]
  #[test]
  fn perturbation_is_centered_on_gray() {
    let mut p = Array3::zeros((3, 1, 3));
    p[[0, 0, 0]] = 0.03;
    p[[0, 0, 2]] = -0.03;
    let image = perturbation_image(&p, 0.03);
    assert_eq!(image.get_pixel(0, 0)[0], 255);
    assert_eq!(image.get_pixel(1, 0)[0], 128);
    assert_eq!(image.get_pixel(2, 0)[0], 0);
  }
}
