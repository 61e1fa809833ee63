// 该文件是 Shanan （山南西风） 项目的一部分。
// src/attack/termination.rs - 迭代终止判定
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

use crate::attack::{StopReason, mask::RegionMask};

/// 按固定优先级判断是否停止：抑制成功、区域饱和、迭代耗尽
#[derive(Debug, Clone, Copy)]
pub struct TerminationPolicy {
  pub stop_threshold: f32,
  pub max_iterations: usize,
}

impl TerminationPolicy {
  pub fn new(stop_threshold: f32, max_iterations: usize) -> Self {
    Self {
      stop_threshold,
      max_iterations,
    }
  }

  /// 检测数不高于初始数量的 stop_threshold 倍即视为抑制成功
  pub fn is_suppressed(&self, initial: usize, current: usize) -> bool {
    (current as f64) <= self.stop_threshold as f64 * initial as f64
  }

  pub fn evaluate(
    &self,
    iteration: usize,
    initial: usize,
    current: usize,
    mask: &RegionMask,
  ) -> Option<StopReason> {
    if self.is_suppressed(initial, current) {
      Some(StopReason::Suppressed)
    } else if mask.all_excluded() {
      Some(StopReason::AllRegionsSaturated)
    } else if iteration + 1 >= self.max_iterations {
      Some(StopReason::IterationBudgetExhausted)
    } else {
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::Array2;

  fn mask(gated_regions: usize, regions_excluded: usize) -> RegionMask {
    RegionMask {
      mask: Array2::ones((2, 2)),
      gated_regions,
      regions_excluded,
      mean_similarity: None,
    }
  }

  #[test]
  fn suppression_uses_inclusive_threshold() {
    let policy = TerminationPolicy::new(0.1, 50);
    assert_eq!(policy.evaluate(0, 10, 1, &mask(1, 0)), Some(StopReason::Suppressed));
    assert_eq!(policy.evaluate(0, 10, 2, &mask(1, 0)), None);
    assert_eq!(policy.evaluate(0, 3, 0, &mask(1, 0)), Some(StopReason::Suppressed));
  }

  #[test]
  fn zero_threshold_needs_no_detections() {
    let policy = TerminationPolicy::new(0.0, 50);
    assert_eq!(policy.evaluate(3, 5, 1, &mask(1, 0)), None);
    assert_eq!(policy.evaluate(3, 5, 0, &mask(1, 0)), Some(StopReason::Suppressed));
  }

  #[test]
  fn saturation_requires_gated_regions() {
    let policy = TerminationPolicy::new(0.1, 50);
    assert_eq!(
      policy.evaluate(4, 10, 5, &mask(2, 2)),
      Some(StopReason::AllRegionsSaturated)
    );
    assert_eq!(policy.evaluate(4, 10, 5, &mask(0, 0)), None);
    assert_eq!(policy.evaluate(4, 10, 5, &mask(2, 1)), None);
  }

  #[test]
  fn suppression_wins_over_saturation_and_budget() {
    let policy = TerminationPolicy::new(0.5, 5);
    assert_eq!(policy.evaluate(4, 4, 2, &mask(2, 2)), Some(StopReason::Suppressed));
    assert_eq!(
      policy.evaluate(4, 4, 3, &mask(2, 2)),
      Some(StopReason::AllRegionsSaturated)
    );
    assert_eq!(
      policy.evaluate(4, 4, 3, &mask(2, 0)),
      Some(StopReason::IterationBudgetExhausted)
    );
    assert_eq!(policy.evaluate(3, 4, 3, &mask(2, 0)), None);
  }
}
