// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/attack_scenarios.rs - 脚本化检测器下的攻击流程
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

use std::{cell::Cell, rc::Rc};

use ndarray::{Array3, ArrayView3, s};
use shanan_attack::{
  BBox,
  attack::{
    AttackConfig, AttackController, StopReason,
    similarity::SimilarityMeasure,
  },
  model::{Detection, DetectionOracle, LossGradient, OracleError, RawOutput},
};

/// 检测数由已发生的梯度调用次数决定
struct Scripted {
  calls: Rc<Cell<usize>>,
  count: Box<dyn Fn(usize) -> usize>,
  boxes: Vec<BBox>,
  stride: u32,
  fail_gradient_at: Option<usize>,
  wrong_gradient_shape: bool,
  /// 成功返回这么多次检测结果之后，检测一直失败
  fail_detections_after: Option<usize>,
  detect_calls: Cell<usize>,
}

impl Scripted {
  fn new(count: impl Fn(usize) -> usize + 'static) -> Self {
    Self {
      calls: Rc::new(Cell::new(0)),
      count: Box::new(count),
      boxes: vec![[0.0, 0.0, 16.0, 16.0]],
      stride: 8,
      fail_gradient_at: None,
      wrong_gradient_shape: false,
      fail_detections_after: None,
      detect_calls: Cell::new(0),
    }
  }
}

impl DetectionOracle for Scripted {
  fn stride(&self) -> u32 {
    self.stride
  }

  fn forward(&self, _image: &Array3<f32>) -> Result<RawOutput, OracleError> {
    Err(OracleError::GradientUnavailable("scripted".into()))
  }

  fn loss_and_gradient(
    &self,
    image: &Array3<f32>,
    _target: Option<u32>,
    _ground_truth: &[BBox],
  ) -> Result<LossGradient, OracleError> {
    let call = self.calls.get();
    if self.fail_gradient_at == Some(call) {
      return Err(OracleError::GradientUnavailable("scripted failure".into()));
    }
    self.calls.set(call + 1);

    let dim = if self.wrong_gradient_shape {
      (1, 1, 1)
    } else {
      image.dim()
    };
    // 正负交替的梯度
    let gradient = Array3::from_shape_fn(dim, |(c, y, x)| {
      if (c + y + x) % 2 == 0 { 0.7 } else { -0.4 }
    });
    Ok(LossGradient {
      loss: -((self.count)(call) as f32),
      gradient,
      strategy: "scripted",
    })
  }

  fn current_detections(
    &self,
    _image: &Array3<f32>,
    _target: Option<u32>,
  ) -> Result<Vec<Detection>, OracleError> {
    let detect_call = self.detect_calls.get();
    self.detect_calls.set(detect_call + 1);
    if self.fail_detections_after.is_some_and(|after| detect_call >= after) {
      return Err(OracleError::UnrecognizedLayout(vec![1, 1]));
    }

    let count = (self.count)(self.calls.get());
    Ok(
      (0..count)
        .map(|i| Detection {
          bbox: self.boxes[i % self.boxes.len()],
          class_id: 0,
          objectness: 0.9,
          class_score: 0.9,
        })
        .collect(),
    )
  }
}

struct AlwaysSimilar;

impl SimilarityMeasure for AlwaysSimilar {
  fn similarity(&self, _: ArrayView3<f32>, _: ArrayView3<f32>) -> f32 {
    1.0
  }
}

/// 从第 `from` 次梯度调用之后所有区域都不再相似
struct DissimilarAfter {
  calls: Rc<Cell<usize>>,
  from: usize,
}

impl SimilarityMeasure for DissimilarAfter {
  fn similarity(&self, _: ArrayView3<f32>, _: ArrayView3<f32>) -> f32 {
    if self.calls.get() >= self.from { 0.0 } else { 1.0 }
  }
}

/// 原图偏暗的区域允许扰动，偏亮的区域被排除
struct DarkRegionsOnly;

impl SimilarityMeasure for DarkRegionsOnly {
  fn similarity(&self, _: ArrayView3<f32>, original: ArrayView3<f32>) -> f32 {
    let mean = original.sum() / original.len() as f32;
    if mean < 0.5 { 1.0 } else { 0.0 }
  }
}

fn textured(h: usize, w: usize) -> Array3<f32> {
  Array3::from_shape_fn((3, h, w), |(c, y, x)| 0.3 + 0.4 * ((c * 7 + y * 3 + x) % 5) as f32 / 4.0)
}

#[test]
fn detections_decreasing_each_iteration_stop_at_nine() {
  let oracle = Scripted::new(|calls| 10 - calls.saturating_sub(1));
  let config = AttackConfig {
    epsilon: 0.03,
    initial_step_size: 1.0,
    max_iterations: 50,
    stop_threshold: 0.1,
    ..Default::default()
  };

  let image = textured(16, 16);
  let result = AttackController::new(&oracle, config)
    .with_similarity(AlwaysSimilar)
    .run(&image)
    .unwrap();

  assert_eq!(result.stop_reason, StopReason::Suppressed);
  assert_eq!(result.stop_iteration, Some(9));
  assert_eq!(result.iterations, 10);
  assert_eq!(result.initial_detections, 10);
  assert_eq!(result.final_detections, 1);
  let counts: Vec<_> = result.trace.iter().map(|r| r.detection_count).collect();
  assert_eq!(counts, (1..=10).rev().collect::<Vec<_>>());
  assert!(result.perturbation.iter().all(|p| p.abs() <= 0.03 + 1e-6));
  assert!(result.max_perturbation() > 0.0);
}

#[test]
fn count_dropping_to_zero_stops_at_that_iteration() {
  let oracle = Scripted::new(|calls| if calls >= 6 { 0 } else { 4 });
  let config = AttackConfig {
    stop_threshold: 0.0,
    ..Default::default()
  };
  let result = AttackController::new(&oracle, config)
    .with_similarity(AlwaysSimilar)
    .run(&textured(16, 16))
    .unwrap();

  assert_eq!(result.stop_reason, StopReason::Suppressed);
  assert_eq!(result.stop_iteration, Some(5));
  assert_eq!(result.final_detections, 0);
}

#[test]
fn all_regions_excluded_saturates() {
  let oracle = Scripted::new(|_| 10);
  let similarity = DissimilarAfter {
    calls: oracle.calls.clone(),
    from: 4,
  };
  let result = AttackController::new(&oracle, AttackConfig::default())
    .with_similarity(similarity)
    .run(&textured(16, 16))
    .unwrap();

  assert_eq!(result.stop_reason, StopReason::AllRegionsSaturated);
  assert_eq!(result.stop_iteration, Some(3));
  let last = result.trace.last().unwrap();
  assert_eq!(last.regions_excluded, 10);
  assert_eq!(last.mask_coverage, 0.0);
}

#[test]
fn excluded_regions_receive_no_update() {
  let mut oracle = Scripted::new(|_| 2);
  oracle.boxes = vec![[0.0, 0.0, 8.0, 16.0], [8.0, 0.0, 16.0, 16.0]];

  // 左半边偏暗，右半边偏亮
  let mut image = textured(16, 16).mapv(|v| v * 0.5);
  image
    .slice_mut(s![.., .., 8..])
    .mapv_inplace(|v| v + 0.45);

  let config = AttackConfig {
    max_iterations: 1,
    initial_step_size: 0.02,
    ..Default::default()
  };
  let result = AttackController::new(&oracle, config)
    .with_similarity(DarkRegionsOnly)
    .run(&image)
    .unwrap();

  assert_eq!(result.stop_reason, StopReason::IterationBudgetExhausted);
  assert_eq!(result.trace[0].regions_excluded, 1);
  assert!(
    result
      .perturbation
      .slice(s![.., .., 8..])
      .iter()
      .all(|&p| p == 0.0)
  );
  assert!(
    result
      .perturbation
      .slice(s![.., .., ..8])
      .iter()
      .all(|&p| p != 0.0)
  );
}

#[test]
fn no_initial_detections_short_circuits() {
  let oracle = Scripted::new(|_| 0);
  let image = textured(20, 30);
  let result = AttackController::new(&oracle, AttackConfig::default())
    .run(&image)
    .unwrap();

  assert_eq!(result.stop_reason, StopReason::NoInitialDetections);
  assert_eq!(result.stop_iteration, None);
  assert_eq!(result.iterations, 0);
  assert_eq!(result.perturbation.dim(), (3, 20, 30));
  assert!(result.perturbation.iter().all(|&p| p == 0.0));
  assert_eq!(oracle.calls.get(), 0);
}

#[test]
fn failed_initial_detection_counts_as_no_detections() {
  let mut oracle = Scripted::new(|_| 4);
  oracle.fail_detections_after = Some(0);
  let result = AttackController::new(&oracle, AttackConfig::default())
    .run(&textured(16, 16))
    .unwrap();

  assert_eq!(result.stop_reason, StopReason::NoInitialDetections);
  assert_eq!(result.stop_iteration, None);
  assert_eq!(result.iterations, 0);
  assert!(result.perturbation.iter().all(|&p| p == 0.0));
  assert_eq!(oracle.calls.get(), 0);
}

#[test]
fn failed_detection_mid_run_counts_as_no_detections() {
  let mut oracle = Scripted::new(|_| 4);
  oracle.fail_detections_after = Some(1);
  let result = AttackController::new(&oracle, AttackConfig::default())
    .with_similarity(AlwaysSimilar)
    .run(&textured(16, 16))
    .unwrap();

  assert_eq!(result.initial_detections, 4);
  assert_eq!(result.stop_reason, StopReason::Suppressed);
  assert_eq!(result.stop_iteration, Some(0));
  assert_eq!(result.iterations, 1);
  assert_eq!(result.final_detections, 0);
  let record = &result.trace[0];
  assert_eq!(record.detection_count, 0);
  assert_eq!(record.mask_coverage, 1.0);
  assert_eq!(record.regions_excluded, 0);
  assert!(result.perturbation.iter().all(|&p| p != 0.0));
}

#[test]
fn perturbation_is_restored_to_caller_resolution() {
  let oracle = Scripted::new(|_| 3);
  let image = textured(20, 30);
  let config = AttackConfig {
    max_iterations: 5,
    epsilon: 0.05,
    initial_step_size: 0.02,
    ..Default::default()
  };
  let result = AttackController::new(&oracle, config)
    .with_similarity(AlwaysSimilar)
    .run(&image)
    .unwrap();

  assert_eq!(result.perturbation.dim(), (3, 20, 30));
  assert!(result.max_perturbation() <= 0.05 + 1e-6);
  let adversarial = result.apply_to(&image);
  assert!(adversarial.iter().all(|v| (0.0..=1.0).contains(v)));
}

#[test]
fn perturbation_never_leaves_the_valid_range() {
  let oracle = Scripted::new(|_| 5);
  // 贴近取值范围两端的图像
  let image = Array3::from_shape_fn((3, 16, 16), |(c, y, x)| {
    if (c + y + x) % 3 == 0 { 0.0 } else { 0.995 }
  });
  let config = AttackConfig {
    max_iterations: 20,
    epsilon: 0.1,
    initial_step_size: 0.04,
    ..Default::default()
  };
  let result = AttackController::new(&oracle, config)
    .with_similarity(AlwaysSimilar)
    .run(&image)
    .unwrap();

  let adversarial = &image + &result.perturbation;
  assert!(adversarial.iter().all(|v| (-1e-6..=1.0 + 1e-6).contains(v)));
  for record in &result.trace {
    assert!(record.perturbation_magnitude <= 0.1 + 1e-6);
  }
}

#[test]
fn zero_epsilon_leaves_image_untouched() {
  let oracle = Scripted::new(|_| 5);
  let config = AttackConfig {
    epsilon: 0.0,
    max_iterations: 3,
    ..Default::default()
  };
  let result = AttackController::new(&oracle, config)
    .with_similarity(AlwaysSimilar)
    .run(&textured(16, 16))
    .unwrap();

  assert_eq!(result.stop_reason, StopReason::IterationBudgetExhausted);
  assert_eq!(result.max_perturbation(), 0.0);
  assert_eq!(result.trace[0].step_size, 0.005);
}

#[test]
fn gradient_failure_stops_with_last_projected_state() {
  let mut oracle = Scripted::new(|_| 5);
  oracle.fail_gradient_at = Some(2);
  let result = AttackController::new(&oracle, AttackConfig::default())
    .with_similarity(AlwaysSimilar)
    .run(&textured(16, 16))
    .unwrap();

  assert_eq!(result.stop_reason, StopReason::GradientUnavailable);
  assert_eq!(result.stop_iteration, Some(2));
  assert_eq!(result.iterations, 2);
  assert!(result.max_perturbation() > 0.0);
  assert!(result.max_perturbation() <= 0.03 + 1e-6);
}

#[test]
fn gradient_with_wrong_shape_is_unavailable() {
  let mut oracle = Scripted::new(|_| 5);
  oracle.wrong_gradient_shape = true;
  let result = AttackController::new(&oracle, AttackConfig::default())
    .run(&textured(16, 16))
    .unwrap();

  assert_eq!(result.stop_reason, StopReason::GradientUnavailable);
  assert_eq!(result.stop_iteration, Some(0));
  assert_eq!(result.max_perturbation(), 0.0);
}
