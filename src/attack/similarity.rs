// 该文件是 Shanan （山南西风） 项目的一部分。
// src/attack/similarity.rs - 区域相似度门控
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

use ndarray::ArrayView3;

/// 标准差的平滑项，避免零方差区域除零
const NCC_EPS: f32 = 1e-8;

/// 两个同形区域之间的相似度度量
pub trait SimilarityMeasure {
  fn similarity(&self, working: ArrayView3<f32>, original: ArrayView3<f32>) -> f32;
}

/// 归一化互相关
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedCrossCorrelation;

fn mean_std(region: &ArrayView3<f32>) -> (f32, f32) {
  let n = region.len() as f32;
  let mean = region.sum() / n;
  let var = region.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
  (mean, var.sqrt())
}

/// 展平后分别做零均值、单位方差归一化，再求逐元素乘积的均值
pub fn ncc(a: ArrayView3<f32>, b: ArrayView3<f32>) -> f32 {
  if a.is_empty() || a.shape() != b.shape() {
    return 0.0;
  }

  let (mean_a, std_a) = mean_std(&a);
  let (mean_b, std_b) = mean_std(&b);
  let denom_a = std_a + NCC_EPS;
  let denom_b = std_b + NCC_EPS;

  let sum: f32 = a
    .iter()
    .zip(b.iter())
    .map(|(x, y)| ((x - mean_a) / denom_a) * ((y - mean_b) / denom_b))
    .sum();
  sum / a.len() as f32
}

impl SimilarityMeasure for NormalizedCrossCorrelation {
  fn similarity(&self, working: ArrayView3<f32>, original: ArrayView3<f32>) -> f32 {
    ncc(working, original)
  }
}

impl<T: SimilarityMeasure + ?Sized> SimilarityMeasure for &T {
  fn similarity(&self, working: ArrayView3<f32>, original: ArrayView3<f32>) -> f32 {
    (**self).similarity(working, original)
  }
}
