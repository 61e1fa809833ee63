// 该文件是 Shanan （山南西风） 项目的一部分。
// src/attack/mask.rs - 基于检测结果的区域掩码
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

use ndarray::{Array2, Array3, s};
use tracing::trace;

use crate::{BBox, attack::similarity::SimilarityMeasure, model::Detection};

/// 本次迭代允许更新的像素
#[derive(Debug, Clone)]
pub struct RegionMask {
  /// (高, 宽) 的 0/1 掩码，在通道维度上广播
  pub mask: Array2<f32>,
  /// 裁剪后非空、参与相似度门控的区域数
  pub gated_regions: usize,
  pub regions_excluded: usize,
  pub mean_similarity: Option<f32>,
}

impl RegionMask {
  pub fn coverage(&self) -> f32 {
    if self.mask.is_empty() {
      0.0
    } else {
      self.mask.sum() / self.mask.len() as f32
    }
  }

  /// 所有参与门控的区域都已被排除
  pub fn all_excluded(&self) -> bool {
    self.gated_regions > 0 && self.regions_excluded == self.gated_regions
  }
}

/// 把边界框裁剪到图像范围内，返回像素区间 (y0, y1, x0, x1)
pub fn clip_box(bbox: &BBox, height: usize, width: usize) -> Option<(usize, usize, usize, usize)> {
  if bbox.iter().any(|v| !v.is_finite()) {
    return None;
  }
  let x0 = bbox[0].floor().clamp(0.0, width as f32) as usize;
  let y0 = bbox[1].floor().clamp(0.0, height as f32) as usize;
  let x1 = bbox[2].ceil().clamp(0.0, width as f32) as usize;
  let y1 = bbox[3].ceil().clamp(0.0, height as f32) as usize;

  (x1 > x0 && y1 > y0).then_some((y0, y1, x0, x1))
}

pub struct RegionMaskBuilder<S> {
  measure: S,
  threshold: f32,
}

impl<S: SimilarityMeasure> RegionMaskBuilder<S> {
  pub fn new(measure: S, threshold: f32) -> Self {
    Self { measure, threshold }
  }

  /// 由当前检测结果构造掩码
  ///
  /// 没有检测结果时返回全 1 掩码，以防目标重新出现。
  pub fn build(
    &self,
    detections: &[Detection],
    working: &Array3<f32>,
    original: &Array3<f32>,
  ) -> RegionMask {
    let (_, height, width) = working.dim();

    if detections.is_empty() {
      return RegionMask {
        mask: Array2::ones((height, width)),
        gated_regions: 0,
        regions_excluded: 0,
        mean_similarity: None,
      };
    }

    let mut mask = Array2::<f32>::zeros((height, width));
    let mut gated_regions = 0;
    let mut regions_excluded = 0;
    let mut similarity_sum = 0.0f32;

    for det in detections {
      let Some((y0, y1, x0, x1)) = clip_box(&det.bbox, height, width) else {
        continue;
      };
      gated_regions += 1;

      let score = self.measure.similarity(
        working.slice(s![.., y0..y1, x0..x1]),
        original.slice(s![.., y0..y1, x0..x1]),
      );
      similarity_sum += score;

      if score >= self.threshold {
        mask.slice_mut(s![y0..y1, x0..x1]).fill(1.0);
      } else {
        trace!(
          "区域 [{}, {}, {}, {}] 相似度 {:.4} 低于阈值 {:.4}, 不再扰动",
          x0, y0, x1, y1, score, self.threshold
        );
        regions_excluded += 1;
      }
    }

    RegionMask {
      mask,
      gated_regions,
      regions_excluded,
      mean_similarity: (gated_regions > 0).then(|| similarity_sum / gated_regions as f32),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::attack::similarity::NormalizedCrossCorrelation;
  use ndarray::ArrayView3;

  struct Fixed(f32);

  impl SimilarityMeasure for Fixed {
    fn similarity(&self, _: ArrayView3<f32>, _: ArrayView3<f32>) -> f32 {
      self.0
    }
  }

  /// 左半边区域相似度为 1，右半边为 0
  struct LeftOnly;

  impl SimilarityMeasure for LeftOnly {
    fn similarity(&self, working: ArrayView3<f32>, _: ArrayView3<f32>) -> f32 {
      if working[[0, 0, 0]] < 0.5 { 1.0 } else { 0.0 }
    }
  }

  fn det(bbox: BBox) -> Detection {
    Detection {
      bbox,
      class_id: 0,
      objectness: 1.0,
      class_score: 1.0,
    }
  }

  #[test]
  fn no_detections_means_whole_image() {
    let image = Array3::<f32>::zeros((3, 4, 6));
    let mask = RegionMaskBuilder::new(Fixed(1.0), 0.5).build(&[], &image, &image);
    assert_eq!(mask.coverage(), 1.0);
    assert!(!mask.all_excluded());
  }

  #[test]
  fn overlapping_boxes_are_binarized() {
    let image = Array3::<f32>::zeros((3, 8, 8));
    let mask = RegionMaskBuilder::new(Fixed(1.0), 0.5).build(
      &[det([0.0, 0.0, 4.0, 4.0]), det([2.0, 2.0, 6.0, 6.0])],
      &image,
      &image,
    );
    assert!(mask.mask.iter().all(|&v| v == 0.0 || v == 1.0));
    assert_eq!(mask.mask.sum(), 28.0);
    assert_eq!(mask.gated_regions, 2);
    assert_eq!(mask.regions_excluded, 0);
  }

  #[test]
  fn dissimilar_regions_are_excluded() {
    let mut working = Array3::<f32>::zeros((3, 4, 8));
    working.slice_mut(s![.., .., 4..]).fill(1.0);
    let mask = RegionMaskBuilder::new(LeftOnly, 0.5).build(
      &[det([0.0, 0.0, 4.0, 4.0]), det([4.0, 0.0, 8.0, 4.0])],
      &working,
      &working,
    );
    assert_eq!(mask.regions_excluded, 1);
    assert_eq!(mask.mask.slice(s![.., ..4]).sum(), 16.0);
    assert_eq!(mask.mask.slice(s![.., 4..]).sum(), 0.0);
    assert_eq!(mask.mean_similarity, Some(0.5));
  }

  #[test]
  fn boxes_are_clipped_and_empty_ones_skipped() {
    let image = Array3::<f32>::zeros((3, 4, 4));
    let mask = RegionMaskBuilder::new(Fixed(0.0), 0.5).build(
      &[det([-3.0, -3.0, 2.0, 2.0]), det([10.0, 10.0, 12.0, 12.0])],
      &image,
      &image,
    );
    assert_eq!(mask.gated_regions, 1);
    assert!(mask.all_excluded());
    assert_eq!(mask.coverage(), 0.0);
    assert_eq!(clip_box(&[0.2, 0.2, 1.5, 3.9], 4, 4), Some((0, 4, 0, 2)));
  }

  #[test]
  fn ncc_gate_keeps_untouched_regions() {
    let original = Array3::from_shape_fn((3, 4, 4), |(c, y, x)| (c + y * x) as f32 / 12.0);
    let mask = RegionMaskBuilder::new(NormalizedCrossCorrelation, 0.9).build(
      &[det([0.0, 0.0, 4.0, 4.0])],
      &original,
      &original,
    );
    assert_eq!(mask.coverage(), 1.0);
  }
}
