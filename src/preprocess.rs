// 该文件是 Shanan （山南西风） 项目的一部分。
// src/preprocess.rs - 输入对齐与尺寸还原
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
use thiserror::Error;
use tracing::debug;

use crate::BBox;

#[derive(Error, Debug)]
pub enum PreprocessError {
  #[error("图像无效: 形状 {0:?}")]
  InvalidImage(Vec<usize>),
  #[error("步长无效: {0}")]
  InvalidStride(u32),
}

/// 将图像缩放到检测器步长的整数倍
#[derive(Debug, Clone, Copy)]
pub struct ImagePreprocessor {
  stride: u32,
}

/// 对齐后的图像及还原所需的信息
#[derive(Debug, Clone)]
pub struct AlignedImage {
  pub image: Array3<f32>,
  /// 原始尺寸 (高, 宽)
  pub original_size: (usize, usize),
  /// 缩放系数 (y, x)
  pub scale: (f32, f32),
}

impl ImagePreprocessor {
  pub fn new(stride: u32) -> Result<Self, PreprocessError> {
    if stride == 0 {
      return Err(PreprocessError::InvalidStride(stride));
    }
    Ok(Self { stride })
  }

  pub fn stride(&self) -> u32 {
    self.stride
  }

  /// 不小于原尺寸的最小步长倍数
  pub fn aligned_size(&self, height: usize, width: usize) -> (usize, usize) {
    let s = self.stride as usize;
    (height.div_ceil(s) * s, width.div_ceil(s) * s)
  }

  pub fn align(&self, image: &Array3<f32>) -> Result<AlignedImage, PreprocessError> {
    let (channels, height, width) = image.dim();
    if image.is_empty() || channels == 0 || height == 0 || width == 0 {
      return Err(PreprocessError::InvalidImage(image.shape().to_vec()));
    }

    let (out_h, out_w) = self.aligned_size(height, width);
    debug!(
      "图像对齐: {}x{} -> {}x{} (步长 {})",
      width, height, out_w, out_h, self.stride
    );

    Ok(AlignedImage {
      image: resize_bilinear(image, out_h, out_w),
      original_size: (height, width),
      scale: (out_h as f32 / height as f32, out_w as f32 / width as f32),
    })
  }
}

impl AlignedImage {
  pub fn aligned_size(&self) -> (usize, usize) {
    let (_, h, w) = self.image.dim();
    (h, w)
  }

  /// 将原始像素坐标下的边界框映射到对齐坐标
  pub fn scale_boxes(&self, boxes: &[BBox]) -> Vec<BBox> {
    let (sy, sx) = self.scale;
    boxes
      .iter()
      .map(|b| [b[0] * sx, b[1] * sy, b[2] * sx, b[3] * sy])
      .collect()
  }

  /// 将对齐坐标下的张量还原为原始尺寸
  pub fn restore(&self, aligned: &Array3<f32>) -> Array3<f32> {
    let (h, w) = self.original_size;
    resize_bilinear(aligned, h, w)
  }
}

/// 输出坐标对应的两个源索引与插值系数
fn axis_taps(in_len: usize, out_len: usize) -> Vec<(usize, usize, f32)> {
  let scale = in_len as f64 / out_len as f64;
  (0..out_len)
    .map(|dst| {
      // 像素中心对齐
      let src = ((dst as f64 + 0.5) * scale - 0.5).max(0.0);
      let i0 = (src.floor() as usize).min(in_len - 1);
      let i1 = (i0 + 1).min(in_len - 1);
      let frac = if i1 == i0 { 0.0 } else { (src - i0 as f64) as f32 };
      (i0, i1, frac)
    })
    .collect()
}

/// 按通道进行双线性插值缩放
///
/// 输出是输入的凸组合，因此不会超出输入的取值范围；尺寸不变时为精确拷贝。
pub fn resize_bilinear(image: &Array3<f32>, out_h: usize, out_w: usize) -> Array3<f32> {
  let (channels, in_h, in_w) = image.dim();
  if (in_h, in_w) == (out_h, out_w) {
    return image.clone();
  }
  if in_h == 0 || in_w == 0 {
    return Array3::zeros((channels, out_h, out_w));
  }

  let ys = axis_taps(in_h, out_h);
  let xs = axis_taps(in_w, out_w);

  let mut out = Array3::<f32>::zeros((channels, out_h, out_w));
  for c in 0..channels {
    for (y, &(y0, y1, fy)) in ys.iter().enumerate() {
      for (x, &(x0, x1, fx)) in xs.iter().enumerate() {
        let top = image[[c, y0, x0]] * (1.0 - fx) + image[[c, y0, x1]] * fx;
        let bottom = image[[c, y1, x0]] * (1.0 - fx) + image[[c, y1, x1]] * fx;
        out[[c, y, x]] = top * (1.0 - fy) + bottom * fy;
      }
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;

  #[test]
  fn sizes_round_up_to_stride() {
    let pre = ImagePreprocessor::new(32).unwrap();
    assert_eq!(pre.aligned_size(480, 640), (480, 640));
    assert_eq!(pre.aligned_size(481, 1), (512, 32));
  }

  #[test]
  fn aligned_input_is_left_untouched() {
    let pre = ImagePreprocessor::new(4).unwrap();
    let image = Array3::from_shape_fn((3, 8, 4), |(c, y, x)| (c * 100 + y * 10 + x) as f32);
    let aligned = pre.align(&image).unwrap();
    assert_eq!(aligned.image, image);
    assert_eq!(aligned.scale, (1.0, 1.0));
  }

  #[test]
  fn boxes_follow_the_resize_factor() {
    let pre = ImagePreprocessor::new(32).unwrap();
    let aligned = pre.align(&Array3::zeros((3, 16, 48))).unwrap();
    assert_eq!(aligned.aligned_size(), (32, 64));
    let boxes = aligned.scale_boxes(&[[3.0, 4.0, 12.0, 8.0]]);
    assert_relative_eq!(boxes[0][0], 4.0, epsilon = 1e-5);
    assert_relative_eq!(boxes[0][1], 8.0, epsilon = 1e-5);
    assert_relative_eq!(boxes[0][2], 16.0, epsilon = 1e-5);
    assert_relative_eq!(boxes[0][3], 16.0, epsilon = 1e-5);
  }

  #[test]
  fn restore_returns_original_shape_within_bounds() {
    let pre = ImagePreprocessor::new(32).unwrap();
    let aligned = pre.align(&Array3::zeros((3, 50, 70))).unwrap();
    let noise = Array3::from_shape_fn((3, 64, 96), |(c, y, x)| {
      if (c + y + x) % 2 == 0 { 0.03 } else { -0.03 }
    });
    let restored = aligned.restore(&noise);
    assert_eq!(restored.dim(), (3, 50, 70));
    assert!(restored.iter().all(|v| v.abs() <= 0.03 + 1e-6));
  }

  #[test]
  fn constant_image_stays_constant() {
    let image = Array3::from_elem((3, 5, 7), 0.25);
    let resized = resize_bilinear(&image, 32, 32);
    for v in resized.iter() {
      assert_relative_eq!(*v, 0.25, epsilon = 1e-6);
    }
  }

  #[test]
  fn empty_images_are_rejected() {
    let pre = ImagePreprocessor::new(32).unwrap();
    assert!(matches!(
      pre.align(&Array3::zeros((3, 0, 10))),
      Err(PreprocessError::InvalidImage(_))
    ));
    assert!(matches!(
      pre.align(&Array3::zeros((0, 10, 10))),
      Err(PreprocessError::InvalidImage(_))
    ));
    assert!(ImagePreprocessor::new(0).is_err());
  }
}
