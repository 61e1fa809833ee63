// 该文件是 Shanan （山南西风） 项目的一部分。
// src/attack.rs - 对抗扰动引擎
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

use std::{
  fmt,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
};

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{BBox, preprocess::PreprocessError};

mod controller;
pub mod mask;
pub mod projector;
pub mod similarity;
pub mod step;
pub mod termination;

pub use self::controller::AttackController;

/// 一次攻击的运行参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackConfig {
  pub max_iterations: usize,
  pub initial_step_size: f32,
  /// L∞ 扰动上限
  pub epsilon: f32,
  /// 检测数降到初始数量的该比例以下即视为成功
  pub stop_threshold: f32,
  /// 区域相似度低于该值后不再继续扰动
  pub similarity_threshold: f32,
  pub target_class: Option<u32>,
  /// 原始像素坐标下的真实框
  pub ground_truth: Vec<BBox>,
  /// 像素取值范围 [下限, 上限]
  pub valid_range: [f32; 2],
  /// 每隔多少次迭代向回调汇报一次，0 表示不汇报
  pub report_every: usize,
}

impl Default for AttackConfig {
  fn default() -> Self {
    Self {
      max_iterations: 50,
      initial_step_size: 0.01,
      epsilon: 0.03,
      stop_threshold: 0.1,
      similarity_threshold: 0.8,
      target_class: None,
      ground_truth: Vec::new(),
      valid_range: [0.0, 1.0],
      report_every: 10,
    }
  }
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
  #[error("最大迭代次数必须为正数")]
  ZeroIterations,
  #[error("{0} 必须是非负有限数, 实际为 {1}")]
  Negative(&'static str, f32),
  #[error("{0} 必须位于 [0, 1] 之间, 实际为 {1}")]
  OutOfUnitRange(&'static str, f32),
  #[error("像素取值范围无效: [{0}, {1}]")]
  InvalidRange(f32, f32),
}

fn non_negative(name: &'static str, value: f32) -> Result<(), ConfigError> {
  if value.is_finite() && value >= 0.0 {
    Ok(())
  } else {
    Err(ConfigError::Negative(name, value))
  }
}

fn unit_interval(name: &'static str, value: f32) -> Result<(), ConfigError> {
  if (0.0..=1.0).contains(&value) {
    Ok(())
  } else {
    Err(ConfigError::OutOfUnitRange(name, value))
  }
}

impl AttackConfig {
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.max_iterations == 0 {
      return Err(ConfigError::ZeroIterations);
    }
    non_negative("initial_step_size", self.initial_step_size)?;
    non_negative("epsilon", self.epsilon)?;
    unit_interval("stop_threshold", self.stop_threshold)?;
    unit_interval("similarity_threshold", self.similarity_threshold)?;

    let [lo, hi] = self.valid_range;
    if !(lo.is_finite() && hi.is_finite() && lo < hi) {
      return Err(ConfigError::InvalidRange(lo, hi));
    }
    Ok(())
  }

  pub fn with_ground_truth(mut self, ground_truth: Vec<BBox>) -> Self {
    self.ground_truth = ground_truth;
    self
  }

  pub fn with_target_class(mut self, target_class: Option<u32>) -> Self {
    self.target_class = target_class;
    self
  }
}

/// 攻击结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
  /// 初始图像上没有检测结果，无需攻击
  NoInitialDetections,
  Suppressed,
  /// 所有检测区域都已超出相似度预算
  AllRegionsSaturated,
  IterationBudgetExhausted,
  GradientUnavailable,
  Cancelled,
}

impl StopReason {
  pub fn is_success(&self) -> bool {
    matches!(self, StopReason::Suppressed)
  }
}

impl fmt::Display for StopReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let text = match self {
      StopReason::NoInitialDetections => "初始无检测",
      StopReason::Suppressed => "检测已抑制",
      StopReason::AllRegionsSaturated => "区域扰动饱和",
      StopReason::IterationBudgetExhausted => "迭代次数耗尽",
      StopReason::GradientUnavailable => "梯度不可用",
      StopReason::Cancelled => "已取消",
    };
    f.write_str(text)
  }
}

/// 单次迭代的遥测数据，仅用于观测
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationRecord {
  pub iteration: usize,
  pub detection_count: usize,
  pub loss: f32,
  /// 梯度绝对值的均值
  pub gradient_magnitude: f32,
  pub mask_coverage: f32,
  /// 扰动的 L∞ 范数
  pub perturbation_magnitude: f32,
  /// 参与门控区域的平均相似度
  pub similarity: Option<f32>,
  pub regions_excluded: usize,
  pub step_size: f32,
}

#[derive(Debug, Clone)]
pub struct AttackResult {
  /// 原始分辨率下的扰动
  pub perturbation: Array3<f32>,
  pub stop_reason: StopReason,
  /// 停止时所处的迭代，未进行任何迭代时为 None
  pub stop_iteration: Option<usize>,
  pub iterations: usize,
  pub initial_detections: usize,
  pub final_detections: usize,
  pub trace: Vec<IterationRecord>,
  /// 投影时使用的像素取值范围
  pub valid_range: [f32; 2],
}

impl AttackResult {
  pub fn max_perturbation(&self) -> f32 {
    self.perturbation.iter().fold(0.0f32, |m, v| m.max(v.abs()))
  }

  /// 在原始图像上叠加扰动并限制到攻击时的取值范围
  pub fn apply_to(&self, original: &Array3<f32>) -> Array3<f32> {
    let [lo, hi] = self.valid_range;
    let mut adversarial = original + &self.perturbation;
    adversarial.mapv_inplace(|v| v.clamp(lo, hi));
    adversarial
  }
}

#[derive(Error, Debug)]
pub enum AttackError {
  #[error("图像预处理失败: {0}")]
  InvalidImage(#[from] PreprocessError),
  #[error("攻击参数无效: {0}")]
  InvalidConfig(#[from] ConfigError),
}

/// 外部取消标记，在每次迭代开始时检查
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}
