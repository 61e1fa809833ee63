// 该文件是 Shanan （山南西风） 项目的一部分。
// src/attack/controller.rs - 攻击主循环
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
use tracing::{debug, info, warn};

use crate::{
  BBox,
  attack::{
    AttackConfig, AttackError, AttackResult, CancelToken, IterationRecord, StopReason,
    mask::RegionMaskBuilder,
    projector::{PerturbationProjector, max_abs_diff},
    similarity::{NormalizedCrossCorrelation, SimilarityMeasure},
    step::StepSizeScheduler,
    termination::TerminationPolicy,
  },
  model::{Detection, DetectionOracle},
  preprocess::{AlignedImage, ImagePreprocessor},
};

pub type IterationSink<'a> = Box<dyn FnMut(&IterationRecord) + 'a>;

/// 掩码约束下的符号梯度上升
///
/// 每次迭代依次执行：计算梯度、按当前检测结果和相似度构造掩码、
/// 调整步长、更新并投影工作图像、重新检测，最后判断是否停止。
pub struct AttackController<'a, O, S = NormalizedCrossCorrelation> {
  oracle: O,
  config: AttackConfig,
  similarity: S,
  cancel: Option<CancelToken>,
  sink: Option<IterationSink<'a>>,
}

impl<'a, O: DetectionOracle> AttackController<'a, O> {
  pub fn new(oracle: O, config: AttackConfig) -> Self {
    Self {
      oracle,
      config,
      similarity: NormalizedCrossCorrelation,
      cancel: None,
      sink: None,
    }
  }
}

fn report(
  sink: Option<&mut IterationSink<'_>>,
  every: usize,
  record: &IterationRecord,
  terminal: bool,
) {
  if every == 0 {
    return;
  }
  if let Some(sink) = sink {
    if terminal || (record.iteration + 1) % every == 0 {
      sink(record);
    }
  }
}

/// 梯度符号，零与 NaN 均记为 0
fn sign(g: f32) -> f32 {
  if g > 0.0 {
    1.0
  } else if g < 0.0 {
    -1.0
  } else {
    0.0
  }
}

fn mean_abs(values: &Array3<f32>) -> f32 {
  if values.is_empty() {
    return 0.0;
  }
  let total: f32 = values.iter().filter(|v| v.is_finite()).map(|v| v.abs()).sum();
  total / values.len() as f32
}

impl<'a, O: DetectionOracle, S: SimilarityMeasure> AttackController<'a, O, S> {
  /// 替换区域相似度度量
  pub fn with_similarity<T: SimilarityMeasure>(self, similarity: T) -> AttackController<'a, O, T> {
    AttackController {
      oracle: self.oracle,
      config: self.config,
      similarity,
      cancel: self.cancel,
      sink: self.sink,
    }
  }

  pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
    self.cancel = Some(token);
    self
  }

  /// 每隔 `report_every` 次迭代以及停止时调用
  pub fn with_sink(mut self, sink: impl FnMut(&IterationRecord) + 'a) -> Self {
    self.sink = Some(Box::new(sink));
    self
  }

  fn is_cancelled(&self) -> bool {
    self.cancel.as_ref().is_some_and(|token| token.is_cancelled())
  }

  fn detect(&self, image: &Array3<f32>) -> Vec<Detection> {
    match self.oracle.current_detections(image, self.config.target_class) {
      Ok(detections) => detections,
      Err(e) => {
        warn!("检测失败, 按无检测结果处理: {}", e);
        Vec::new()
      }
    }
  }

  /// 对一张 (C, H, W) 图像执行攻击
  ///
  /// 返回的扰动与输入图像同尺寸。配置或图像无效时直接返回错误，
  /// 一旦开始迭代，总会得到完整的 [`AttackResult`]。
  pub fn run(&mut self, image: &Array3<f32>) -> Result<AttackResult, AttackError> {
    self.config.validate()?;
    let preprocessor = ImagePreprocessor::new(self.oracle.stride())?;
    let aligned = preprocessor.align(image)?;
    let ground_truth: Vec<BBox> = aligned.scale_boxes(&self.config.ground_truth);
    let original = &aligned.image;

    let initial_detections = self.detect(original).len();
    info!(
      "开始攻击: 初始检测 {} 个, 图像 {:?} -> {:?}, ε={}, 步长={}",
      initial_detections,
      aligned.original_size,
      aligned.aligned_size(),
      self.config.epsilon,
      self.config.initial_step_size
    );

    if initial_detections == 0 {
      info!("初始图像上没有检测结果, 跳过攻击");
      return Ok(AttackResult {
        perturbation: Array3::zeros(image.dim()),
        stop_reason: StopReason::NoInitialDetections,
        stop_iteration: None,
        iterations: 0,
        initial_detections,
        final_detections: 0,
        trace: Vec::new(),
        valid_range: self.config.valid_range,
      });
    }

    let mask_builder = RegionMaskBuilder::new(&self.similarity, self.config.similarity_threshold);
    let projector = PerturbationProjector::new(self.config.epsilon, self.config.valid_range);
    let policy = TerminationPolicy::new(self.config.stop_threshold, self.config.max_iterations);
    let mut scheduler = StepSizeScheduler::new(self.config.initial_step_size);

    let mut working = original.clone();
    let mut trace = Vec::new();
    let mut final_detections = initial_detections;
    let mut outcome = (StopReason::IterationBudgetExhausted, None);

    for iteration in 0..self.config.max_iterations {
      if self.is_cancelled() {
        info!("攻击在第 {} 次迭代前被取消", iteration);
        outcome = (StopReason::Cancelled, Some(iteration));
        break;
      }

      let gradient = match self.oracle.loss_and_gradient(
        &working,
        self.config.target_class,
        &ground_truth,
      ) {
        Ok(result) if result.gradient.dim() == working.dim() => result,
        Ok(result) => {
          warn!(
            "梯度形状 {:?} 与图像形状 {:?} 不一致",
            result.gradient.shape(),
            working.shape()
          );
          outcome = (StopReason::GradientUnavailable, Some(iteration));
          break;
        }
        Err(e) => {
          warn!("第 {} 次迭代无法获得梯度: {}", iteration, e);
          outcome = (StopReason::GradientUnavailable, Some(iteration));
          break;
        }
      };

      let detections = self.detect(&working);
      let mask = mask_builder.build(&detections, &working, original);

      let step = scheduler.update(max_abs_diff(&working, original), self.config.epsilon);
      for (channel, grad) in working.outer_iter_mut().zip(gradient.gradient.outer_iter()) {
        Zip::from(channel)
          .and(grad)
          .and(&mask.mask)
          .for_each(|w, &g, &m| *w += step * sign(g) * m);
      }
      projector.project(&mut working, original);

      let current = self.detect(&working).len();
      final_detections = current;

      let record = IterationRecord {
        iteration,
        detection_count: current,
        loss: gradient.loss,
        gradient_magnitude: mean_abs(&gradient.gradient),
        mask_coverage: mask.coverage(),
        perturbation_magnitude: max_abs_diff(&working, original),
        similarity: mask.mean_similarity,
        regions_excluded: mask.regions_excluded,
        step_size: step,
      };
      debug!(
        "迭代 {}: 检测 {} 个, 损失 {:.5} ({}), 掩码覆盖 {:.3}, 扰动 {:.4}, 排除区域 {}",
        iteration,
        current,
        record.loss,
        gradient.strategy,
        record.mask_coverage,
        record.perturbation_magnitude,
        record.regions_excluded
      );

      let stop = policy.evaluate(iteration, initial_detections, current, &mask);
      report(
        self.sink.as_mut(),
        self.config.report_every,
        &record,
        stop.is_some(),
      );
      trace.push(record);

      if let Some(reason) = stop {
        outcome = (reason, Some(iteration));
        break;
      }
    }

    let (stop_reason, stop_iteration) = outcome;
    let perturbation = restore_perturbation(&aligned, &working);
    info!(
      "攻击结束: {} (迭代 {} 次), 检测 {} -> {}, 最大扰动 {:.4}",
      stop_reason,
      trace.len(),
      initial_detections,
      final_detections,
      max_abs_diff(&working, original)
    );

    Ok(AttackResult {
      perturbation,
      stop_reason,
      stop_iteration,
      iterations: trace.len(),
      initial_detections,
      final_detections,
      trace,
      valid_range: self.config.valid_range,
    })
  }
}

/// 把对齐坐标下的扰动还原到调用方的分辨率
fn restore_perturbation(aligned: &AlignedImage, working: &Array3<f32>) -> Array3<f32> {
  let delta = working - &aligned.image;
  aligned.restore(&delta)
}
