// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/oracle.rs - 检测器预言机封装
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
  ops::{Deref, DerefMut},
  str::FromStr,
  sync::Mutex,
};

use ndarray::Array3;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::{
  BBox, FromUrl,
  model::{
    Detection, DetectionOracle, Detector, LossGradient, Mode, OracleError, RawOutput,
    layout::{OutputLayout, ParseContext, ParseDetections, standard_data},
    loss::{ConfidenceProxyLoss, FullDetectionLoss, LossError, LossQuery, LossStrategy},
    nms,
  },
};

const DEFAULT_OBJECT_THRESH: f32 = 0.5;
const DEFAULT_NMS_THRESH: f32 = 0.45;

/// 优先使用的损失
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossKind {
  /// 完整检测损失，不可用时退回代理损失
  #[default]
  Full,
  Proxy,
}

#[derive(Error, Debug)]
#[error("未知的损失类型: {0}")]
pub struct UnknownLossKind(String);

impl FromStr for LossKind {
  type Err = UnknownLossKind;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "full" => Ok(LossKind::Full),
      "proxy" => Ok(LossKind::Proxy),
      other => Err(UnknownLossKind(other.to_string())),
    }
  }
}

#[derive(Error, Debug)]
pub enum DetectorOracleBuilderError {
  #[error("参数 {0} 无效: {1}")]
  InvalidParameter(String, String),
}

pub struct DetectorOracleBuilder {
  threshold: f32,
  nms_threshold: f32,
  loss: LossKind,
  iou_weight: f32,
}

impl Default for DetectorOracleBuilder {
  fn default() -> Self {
    Self {
      threshold: DEFAULT_OBJECT_THRESH,
      nms_threshold: DEFAULT_NMS_THRESH,
      loss: LossKind::default(),
      iou_weight: FullDetectionLoss::default().iou_weight,
    }
  }
}

fn parse_param<T: FromStr>(key: &str, value: &str) -> Result<T, DetectorOracleBuilderError> {
  value
    .parse()
    .map_err(|_| DetectorOracleBuilderError::InvalidParameter(key.to_string(), value.to_string()))
}

/// 从模型 URL 的查询参数读取预言机设置，与具体方案无关
impl FromUrl for DetectorOracleBuilder {
  type Error = DetectorOracleBuilderError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let mut builder = DetectorOracleBuilder::default();
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "threshold" => builder.threshold = parse_param(&k, &v)?,
        "nms" => builder.nms_threshold = parse_param(&k, &v)?,
        "loss" => builder.loss = parse_param(&k, &v)?,
        "iou_weight" => builder.iou_weight = parse_param(&k, &v)?,
        _ => {}
      }
    }
    Ok(builder)
  }
}

impl DetectorOracleBuilder {
  pub fn threshold(mut self, threshold: f32) -> Self {
    self.threshold = threshold;
    self
  }

  pub fn nms_threshold(mut self, nms_threshold: f32) -> Self {
    self.nms_threshold = nms_threshold;
    self
  }

  pub fn loss(mut self, loss: LossKind) -> Self {
    self.loss = loss;
    self
  }

  pub fn iou_weight(mut self, iou_weight: f32) -> Self {
    self.iou_weight = iou_weight;
    self
  }

  pub fn build<D: Detector>(self, detector: D) -> DetectorOracle<D> {
    debug!(
      "创建检测器预言机: 阈值={}, NMS={}, 损失={:?}",
      self.threshold, self.nms_threshold, self.loss
    );
    DetectorOracle {
      detector: Mutex::new(detector),
      threshold: self.threshold,
      nms_threshold: self.nms_threshold,
      loss: self.loss,
      full_loss: FullDetectionLoss {
        iou_weight: self.iou_weight,
      },
    }
  }
}

/// 将可微分检测器封装为攻击引擎使用的预言机
///
/// 对检测器的访问通过互斥锁串行化，每次调用前后都会恢复检测器的运行模式，
/// 因此同一个预言机可以在多个攻击之间共享。
pub struct DetectorOracle<D> {
  detector: Mutex<D>,
  threshold: f32,
  nms_threshold: f32,
  loss: LossKind,
  full_loss: FullDetectionLoss,
}

/// 在作用域内切换检测器模式，离开作用域时恢复原模式
struct ModeGuard<'a, D: Detector> {
  detector: &'a mut D,
  previous: Mode,
}

impl<'a, D: Detector> ModeGuard<'a, D> {
  fn new(detector: &'a mut D, mode: Mode) -> Self {
    let previous = detector.mode();
    detector.set_mode(mode);
    Self { detector, previous }
  }
}

impl<D: Detector> Deref for ModeGuard<'_, D> {
  type Target = D;

  fn deref(&self) -> &D {
    self.detector
  }
}

impl<D: Detector> DerefMut for ModeGuard<'_, D> {
  fn deref_mut(&mut self) -> &mut D {
    self.detector
  }
}

impl<D: Detector> Drop for ModeGuard<'_, D> {
  fn drop(&mut self) {
    self.detector.set_mode(self.previous);
  }
}

impl<D: Detector> DetectorOracle<D> {
  pub fn into_inner(self) -> Result<D, OracleError> {
    self.detector.into_inner().map_err(|_| OracleError::Poisoned)
  }

  /// 以指定模式执行一次调用
  fn with_mode<T>(
    &self,
    mode: Mode,
    f: impl FnOnce(&mut D) -> Result<T, OracleError>,
  ) -> Result<T, OracleError> {
    let mut detector = self.detector.lock().map_err(|_| OracleError::Poisoned)?;
    let mut guard = ModeGuard::new(&mut *detector, mode);
    f(&mut *guard)
  }

  fn evaluate_loss(
    &self,
    output: &RawOutput,
    layout: &OutputLayout,
    query: &LossQuery,
  ) -> Result<(f32, RawOutput, &'static str), LossError> {
    if self.loss == LossKind::Full {
      match self.full_loss.evaluate(output, layout, query) {
        Ok((loss, grad)) => return Ok((loss, grad, self.full_loss.name())),
        Err(e) if e.is_recoverable() => {
          debug!("完整检测损失不可用 ({}), 退回代理损失", e);
        }
        Err(e) => return Err(e),
      }
    }
    let (loss, grad) = ConfidenceProxyLoss.evaluate(output, layout, query)?;
    Ok((loss, grad, ConfidenceProxyLoss.name()))
  }
}

fn image_size(image: &Array3<f32>) -> (usize, usize) {
  let (_, h, w) = image.dim();
  (h, w)
}

impl<D: Detector> DetectionOracle for DetectorOracle<D> {
  fn stride(&self) -> u32 {
    match self.detector.lock() {
      Ok(detector) => detector.stride(),
      Err(poisoned) => poisoned.into_inner().stride(),
    }
  }

  fn forward(&self, image: &Array3<f32>) -> Result<RawOutput, OracleError> {
    self.with_mode(Mode::Eval, |detector| {
      detector.forward(image).map_err(OracleError::detector)
    })
  }

  fn loss_and_gradient(
    &self,
    image: &Array3<f32>,
    target: Option<u32>,
    ground_truth: &[BBox],
  ) -> Result<LossGradient, OracleError> {
    self.with_mode(Mode::Train, |detector| {
      let output = detector.forward(image).map_err(OracleError::detector)?;
      let layout = OutputLayout::from_shape(output.shape())
        .ok_or_else(|| OracleError::UnrecognizedLayout(output.shape().to_vec()))?;

      let query = LossQuery {
        target,
        ground_truth,
        ctx: ParseContext {
          image_size: image_size(image),
        },
      };
      let (loss, output_grad, strategy) = self
        .evaluate_loss(&output, &layout, &query)
        .map_err(|e| OracleError::GradientUnavailable(e.to_string()))?;

      let gradient = detector
        .backward(image, &output_grad)
        .map_err(|e| OracleError::GradientUnavailable(e.to_string()))?;
      if gradient.dim() != image.dim() {
        return Err(OracleError::GradientUnavailable(format!(
          "梯度形状 {:?} 与输入形状 {:?} 不一致",
          gradient.shape(),
          image.shape()
        )));
      }

      Ok(LossGradient {
        loss,
        gradient,
        strategy,
      })
    })
  }

  fn current_detections(
    &self,
    image: &Array3<f32>,
    target: Option<u32>,
  ) -> Result<Vec<Detection>, OracleError> {
    let output = self.forward(image)?;
    let Some(layout) = OutputLayout::from_shape(output.shape()) else {
      warn!("无法识别的输出布局 {:?}, 视为没有检测结果", output.shape());
      return Ok(Vec::new());
    };

    let ctx = ParseContext {
      image_size: image_size(image),
    };
    let data = standard_data(&output);
    let mut detections = nms(
      layout.parse_detections(&data, &ctx, self.threshold),
      self.nms_threshold,
    );
    if let Some(target) = target {
      detections.retain(|det| det.class_id == target);
    }

    debug!("{} 布局解析出 {} 个目标", layout.name(), detections.len());
    Ok(detections)
  }
}
