// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 检测模型接口
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

use ndarray::{Array3, ArrayD};
use serde::Serialize;
use thiserror::Error;

use crate::BBox;

/// 检测器原始输出
pub type RawOutput = ArrayD<f32>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  pub bbox: BBox, // [x_min, y_min, x_max, y_max]
  pub class_id: u32,
  pub objectness: f32,
  pub class_score: f32,
}

impl Detection {
  pub fn confidence(&self) -> f32 {
    self.objectness * self.class_score
  }
}

/// 损失值及其对输入图像的梯度
#[derive(Debug, Clone)]
pub struct LossGradient {
  pub loss: f32,
  pub gradient: Array3<f32>,
  pub strategy: &'static str,
}

#[derive(Error, Debug)]
pub enum OracleError {
  #[error("检测器错误: {0}")]
  Detector(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("无法识别的输出布局: {0:?}")]
  UnrecognizedLayout(Vec<usize>),
  #[error("梯度不可用: {0}")]
  GradientUnavailable(String),
  #[error("检测器锁已失效")]
  Poisoned,
}

impl OracleError {
  pub fn detector<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
    OracleError::Detector(Box::new(err))
  }
}

/// 攻击引擎所依赖的检测器接口
///
/// 每次调用都必须是引用透明的：检测器的内部状态（例如训练/推理模式）
/// 在调用前后保持一致。
pub trait DetectionOracle {
  /// 输入尺寸需要对齐的步长
  fn stride(&self) -> u32;

  fn forward(&self, image: &Array3<f32>) -> Result<RawOutput, OracleError>;

  /// 返回待最大化的抑制目标及其对每个像素的梯度
  fn loss_and_gradient(
    &self,
    image: &Array3<f32>,
    target: Option<u32>,
    ground_truth: &[BBox],
  ) -> Result<LossGradient, OracleError>;

  fn current_detections(
    &self,
    image: &Array3<f32>,
    target: Option<u32>,
  ) -> Result<Vec<Detection>, OracleError>;
}

impl<O: DetectionOracle + ?Sized> DetectionOracle for &O {
  fn stride(&self) -> u32 {
    (**self).stride()
  }

  fn forward(&self, image: &Array3<f32>) -> Result<RawOutput, OracleError> {
    (**self).forward(image)
  }

  fn loss_and_gradient(
    &self,
    image: &Array3<f32>,
    target: Option<u32>,
    ground_truth: &[BBox],
  ) -> Result<LossGradient, OracleError> {
    (**self).loss_and_gradient(image, target, ground_truth)
  }

  fn current_detections(
    &self,
    image: &Array3<f32>,
    target: Option<u32>,
  ) -> Result<Vec<Detection>, OracleError> {
    (**self).current_detections(image, target)
  }
}

/// 检测器运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  Train,
  Eval,
}

/// 可微分检测器
pub trait Detector {
  type Error: std::error::Error + Send + Sync + 'static;

  fn stride(&self) -> u32;
  fn mode(&self) -> Mode;
  fn set_mode(&mut self, mode: Mode);

  fn forward(&mut self, image: &Array3<f32>) -> Result<RawOutput, Self::Error>;

  /// 向量-雅可比积：给定损失对输出的梯度，返回损失对输入图像的梯度
  fn backward(
    &mut self,
    image: &Array3<f32>,
    output_grad: &RawOutput,
  ) -> Result<Array3<f32>, Self::Error>;
}

/// 计算两个边界框的 IoU
pub fn iou(a: &BBox, b: &BBox) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 按类别进行非极大值抑制
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
  // 按置信度降序排序
  detections.sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));

  let mut result: Vec<Detection> = Vec::with_capacity(detections.len());
  for det in detections {
    let suppressed = result
      .iter()
      .any(|kept| kept.class_id == det.class_id && iou(&kept.bbox, &det.bbox) >= iou_threshold);
    if !suppressed {
      result.push(det);
    }
  }

  result
}

pub mod labels;
pub mod layout;
pub mod loss;
mod oracle;
mod template;

pub use self::oracle::{
  DetectorOracle, DetectorOracleBuilder, DetectorOracleBuilderError, LossKind, UnknownLossKind,
};
pub use self::template::{TemplateDetector, TemplateDetectorBuilder, TemplateDetectorError};

#[cfg(test)]
mod tests {
  use super::*;

  fn det(bbox: BBox, class_id: u32, score: f32) -> Detection {
    Detection {
      bbox,
      class_id,
      objectness: score,
      class_score: 1.0,
    }
  }

  #[test]
  fn iou_of_identical_boxes_is_one() {
    let b = [0.0, 0.0, 10.0, 10.0];
    assert_eq!(iou(&b, &b), 1.0);
  }

  #[test]
  fn iou_of_disjoint_boxes_is_zero() {
    assert_eq!(iou(&[0.0, 0.0, 1.0, 1.0], &[5.0, 5.0, 6.0, 6.0]), 0.0);
  }

  #[test]
  fn nms_keeps_best_of_overlapping_same_class() {
    let kept = nms(
      vec![
        det([0.0, 0.0, 10.0, 10.0], 0, 0.6),
        det([1.0, 1.0, 10.0, 10.0], 0, 0.9),
      ],
      0.45,
    );
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].objectness, 0.9);
  }

  #[test]
  fn nms_ignores_other_classes() {
    let kept = nms(
      vec![
        det([0.0, 0.0, 10.0, 10.0], 0, 0.6),
        det([0.0, 0.0, 10.0, 10.0], 1, 0.9),
      ],
      0.45,
    );
    assert_eq!(kept.len(), 2);
  }
}
