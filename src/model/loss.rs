// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/loss.rs - 抑制损失
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

//! 抑制目标均为“负的加权置信度之和”，数值越大表示检测被抑制得越彻底。
//! 返回的梯度是目标对检测器原始输出的梯度，与输出同形。

use ndarray::ArrayD;
use thiserror::Error;

use crate::{
  BBox,
  model::{
    RawOutput, iou,
    layout::{Candidate, OutputLayout, ParseContext, ParseDetections, standard_data},
  },
};

#[derive(Error, Debug)]
pub enum LossError {
  #[error("输出布局 {0} 不支持该损失")]
  LayoutMismatch(&'static str),
  #[error("缺少真实框")]
  MissingGroundTruth,
  #[error("梯度形状错误: {0}")]
  Shape(#[from] ndarray::ShapeError),
}

impl LossError {
  /// 是否可以退回到代理损失
  pub fn is_recoverable(&self) -> bool {
    matches!(self, LossError::LayoutMismatch(_) | LossError::MissingGroundTruth)
  }
}

#[derive(Debug, Clone, Copy)]
pub struct LossQuery<'a> {
  pub target: Option<u32>,
  pub ground_truth: &'a [BBox],
  pub ctx: ParseContext,
}

pub trait LossStrategy {
  fn name(&self) -> &'static str;

  /// 返回 (抑制目标, 目标对原始输出的梯度)
  fn evaluate(
    &self,
    output: &RawOutput,
    layout: &OutputLayout,
    query: &LossQuery,
  ) -> Result<(f32, RawOutput), LossError>;
}

/// 完整检测损失：置信度按与真实框的最大 IoU 加权
#[derive(Debug, Clone, Copy)]
pub struct FullDetectionLoss {
  pub iou_weight: f32,
}

impl Default for FullDetectionLoss {
  fn default() -> Self {
    Self { iou_weight: 1.0 }
  }
}

/// 代理损失：目标类别置信度之和
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceProxyLoss;

impl LossStrategy for FullDetectionLoss {
  fn name(&self) -> &'static str {
    "full"
  }

  fn evaluate(
    &self,
    output: &RawOutput,
    layout: &OutputLayout,
    query: &LossQuery,
  ) -> Result<(f32, RawOutput), LossError> {
    if !layout.has_dense_scores() {
      return Err(LossError::LayoutMismatch(layout.name()));
    }
    if query.ground_truth.is_empty() {
      return Err(LossError::MissingGroundTruth);
    }

    // IoU 项作为权重，不对框坐标回传梯度
    weighted_objective(output, layout, query, |cand| {
      let best = query
        .ground_truth
        .iter()
        .map(|gt| iou(&cand.bbox, gt))
        .fold(0.0f32, f32::max);
      1.0 + self.iou_weight * best
    })
  }
}

impl LossStrategy for ConfidenceProxyLoss {
  fn name(&self) -> &'static str {
    "proxy"
  }

  fn evaluate(
    &self,
    output: &RawOutput,
    layout: &OutputLayout,
    query: &LossQuery,
  ) -> Result<(f32, RawOutput), LossError> {
    weighted_objective(output, layout, query, |_| 1.0)
  }
}

fn weighted_objective<F>(
  output: &RawOutput,
  layout: &OutputLayout,
  query: &LossQuery,
  weight: F,
) -> Result<(f32, RawOutput), LossError>
where
  F: Fn(&Candidate) -> f32,
{
  let data = standard_data(output);
  let mut grad = vec![0.0f32; data.len()];
  let mut objective = 0.0f32;

  for cand in layout.candidates(&data, &query.ctx, query.target.into()) {
    let k = weight(&cand);
    objective -= k * cand.confidence();
    grad[cand.objectness_index] -= k * cand.class_score;
    if let Some(class_index) = cand.class_index {
      grad[class_index] -= k * cand.objectness;
    }
  }

  let grad = ArrayD::from_shape_vec(output.raw_dim(), grad)?;
  Ok((objective, grad))
}
