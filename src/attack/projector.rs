// 该文件是 Shanan （山南西风） 项目的一部分。
// src/attack/projector.rs - L∞ 投影
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

use ndarray::{Array3, Zip};

/// 两个同形张量之差的 L∞ 范数
pub fn max_abs_diff(a: &Array3<f32>, b: &Array3<f32>) -> f32 {
  Zip::from(a)
    .and(b)
    .fold(0.0f32, |m, &x, &y| m.max((x - y).abs()))
}

/// 把工作图像投影回原图的 ε 邻域，并限制到像素取值范围
#[derive(Debug, Clone, Copy)]
pub struct PerturbationProjector {
  epsilon: f32,
  valid_range: [f32; 2],
}

impl PerturbationProjector {
  pub fn new(epsilon: f32, valid_range: [f32; 2]) -> Self {
    Self {
      epsilon,
      valid_range,
    }
  }

  /// 原地投影
  ///
  /// 已在邻域内的元素保持不变，因此对投影结果再次投影不会改变任何值。
  pub fn project(&self, working: &mut Array3<f32>, original: &Array3<f32>) {
    let eps = self.epsilon;
    let [lo, hi] = self.valid_range;

    Zip::from(working).and(original).for_each(|w, &o| {
      let mut v = if w.is_nan() { o } else { *w };
      if v - o > eps {
        v = o + eps;
      } else if o - v > eps {
        v = o - eps;
      }
      *w = v.clamp(lo, hi);
    });
  }
}
