// 该文件是 Shanan （山南西风） 项目的一部分。
// src/attack/step.rs - 自适应步长调度
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

use tracing::debug;

const REDUCE_RATIO: f32 = 0.9;
const RESTORE_RATIO: f32 = 0.5;

/// 根据扰动占预算的比例调整步长
///
/// 比例超过 0.9 时步长减半，回落到 0.5 以下时恢复初始步长，
/// 其余情况保持不变。
#[derive(Debug, Clone, Copy)]
pub struct StepSizeScheduler {
  initial: f32,
  current: f32,
}

impl StepSizeScheduler {
  pub fn new(initial: f32) -> Self {
    Self {
      initial,
      current: initial,
    }
  }

  pub fn current(&self) -> f32 {
    self.current
  }

  /// 给出本次迭代使用的步长
  pub fn update(&mut self, max_abs_perturbation: f32, epsilon: f32) -> f32 {
    let ratio = if epsilon > 0.0 {
      max_abs_perturbation / epsilon
    } else {
      1.0
    };

    let reduced = self.initial * 0.5;
    if ratio > REDUCE_RATIO {
      if self.current != reduced {
        debug!("扰动已占预算 {:.2}, 步长降为 {}", ratio, reduced);
      }
      self.current = reduced;
    } else if ratio < RESTORE_RATIO && self.current != self.initial {
      debug!("扰动回落到预算的 {:.2}, 步长恢复为 {}", ratio, self.initial);
      self.current = self.initial;
    }
    self.current
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn starts_at_initial_step() {
    let mut scheduler = StepSizeScheduler::new(0.01);
    assert_eq!(scheduler.current(), 0.01);
    assert_eq!(scheduler.update(0.0, 0.03), 0.01);
  }

  #[test]
  fn halves_near_the_budget_and_recovers() {
    let mut scheduler = StepSizeScheduler::new(0.01);
    assert_eq!(scheduler.update(0.028, 0.03), 0.005);
    // 介于两个阈值之间时保持
    assert_eq!(scheduler.update(0.02, 0.03), 0.005);
    assert_eq!(scheduler.update(0.01, 0.03), 0.01);
  }

  #[test]
  fn never_halves_twice() {
    let mut scheduler = StepSizeScheduler::new(0.01);
    for _ in 0..5 {
      assert_eq!(scheduler.update(0.03, 0.03), 0.005);
    }
  }

  #[test]
  fn zero_budget_counts_as_saturated() {
    let mut scheduler = StepSizeScheduler::new(0.02);
    assert_eq!(scheduler.update(0.0, 0.0), 0.01);
  }
}
