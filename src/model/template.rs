// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/template.rs - 颜色模板检测器
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

//! 一个可解析求导的网格检测器。
//!
//! 每个 stride×stride 的网格单元计算平均颜色 `m`：
//! - 目标度 `σ(g_o·(max m − min m) − b_o)`，即颜色饱和度；
//! - 类别 `c` 的分数 `σ(g_c·(w_c·m) − b_c)`，`w_c` 为按色相均匀分布的颜色方向。
//!
//! 输出为 `[1, H/stride, W/stride, 5 + C]` 的网格布局，检测框即网格单元本身。

use std::f32::consts::TAU;

use ndarray::{Array3, Array4, ArrayView1, ArrayViewMut1};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{Detector, Mode, RawOutput},
};

const RGB_CHANNELS: usize = 3;
const BOX_FIELDS: usize = 5;

const DEFAULT_STRIDE: u32 = 32;
const DEFAULT_CLASSES: usize = 3;
const DEFAULT_OBJECTNESS_GAIN: f32 = 10.0;
const DEFAULT_OBJECTNESS_BIAS: f32 = 5.0;
const DEFAULT_CLASS_GAIN: f32 = 6.0;
const DEFAULT_CLASS_BIAS: f32 = 2.0;

#[derive(Error, Debug)]
pub enum TemplateDetectorError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("参数 {0} 无效: {1}")]
  InvalidParameter(String, String),
  #[error("输入形状 {0:?} 无效，需要 3 通道且高宽可被 {1} 整除")]
  InvalidInput(Vec<usize>, u32),
  #[error("输出梯度形状 {0:?} 与输出形状 {1:?} 不一致")]
  GradientShape(Vec<usize>, Vec<usize>),
}

pub struct TemplateDetectorBuilder {
  stride: u32,
  num_classes: usize,
  objectness_gain: f32,
  objectness_bias: f32,
  class_gain: f32,
  class_bias: f32,
}

impl Default for TemplateDetectorBuilder {
  fn default() -> Self {
    Self {
      stride: DEFAULT_STRIDE,
      num_classes: DEFAULT_CLASSES,
      objectness_gain: DEFAULT_OBJECTNESS_GAIN,
      objectness_bias: DEFAULT_OBJECTNESS_BIAS,
      class_gain: DEFAULT_CLASS_GAIN,
      class_bias: DEFAULT_CLASS_BIAS,
    }
  }
}

impl FromUrlWithScheme for TemplateDetectorBuilder {
  const SCHEME: &'static str = "template";
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, TemplateDetectorError> {
  value
    .parse()
    .map_err(|_| TemplateDetectorError::InvalidParameter(key.to_string(), value.to_string()))
}

impl FromUrl for TemplateDetectorBuilder {
  type Error = TemplateDetectorError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(TemplateDetectorError::SchemeMismatch(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut builder = TemplateDetectorBuilder::default();
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "stride" => builder.stride = parse_param(&k, &v)?,
        "classes" => builder.num_classes = parse_param(&k, &v)?,
        "objectness_gain" => builder.objectness_gain = parse_param(&k, &v)?,
        "objectness_bias" => builder.objectness_bias = parse_param(&k, &v)?,
        "class_gain" => builder.class_gain = parse_param(&k, &v)?,
        "class_bias" => builder.class_bias = parse_param(&k, &v)?,
        _ => {}
      }
    }

    if builder.stride == 0 {
      return Err(TemplateDetectorError::InvalidParameter(
        "stride".to_string(),
        "0".to_string(),
      ));
    }
    if builder.num_classes == 0 {
      return Err(TemplateDetectorError::InvalidParameter(
        "classes".to_string(),
        "0".to_string(),
      ));
    }
    Ok(builder)
  }
}

impl TemplateDetectorBuilder {
  pub fn stride(mut self, stride: u32) -> Self {
    self.stride = stride.max(1);
    self
  }

  pub fn classes(mut self, num_classes: usize) -> Self {
    self.num_classes = num_classes.max(1);
    self
  }

  pub fn build(self) -> TemplateDetector {
    info!(
      "创建颜色模板检测器: 步长 {}, 类别数 {}",
      self.stride, self.num_classes
    );

    let directions = (0..self.num_classes)
      .map(|c| {
        let theta = TAU * c as f32 / self.num_classes as f32;
        [
          theta.cos(),
          (theta - TAU / 3.0).cos(),
          (theta + TAU / 3.0).cos(),
        ]
      })
      .collect();

    TemplateDetector {
      stride: self.stride,
      directions,
      objectness_gain: self.objectness_gain,
      objectness_bias: self.objectness_bias,
      class_gain: self.class_gain,
      class_bias: self.class_bias,
      mode: Mode::Eval,
    }
  }
}

pub struct TemplateDetector {
  stride: u32,
  directions: Vec<[f32; 3]>,
  objectness_gain: f32,
  objectness_bias: f32,
  class_gain: f32,
  class_bias: f32,
  mode: Mode,
}

/// 单个网格单元的中间结果
struct CellState {
  argmax: usize,
  argmin: usize,
  objectness: f32,
  scores: Vec<f32>,
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

impl TemplateDetector {
  pub fn builder() -> TemplateDetectorBuilder {
    TemplateDetectorBuilder::default()
  }

  pub fn num_classes(&self) -> usize {
    self.directions.len()
  }

  fn grid_size(&self, image: &Array3<f32>) -> Result<(usize, usize), TemplateDetectorError> {
    let (c, h, w) = image.dim();
    let s = self.stride as usize;
    if c != RGB_CHANNELS || h == 0 || w == 0 || h % s != 0 || w % s != 0 {
      return Err(TemplateDetectorError::InvalidInput(
        image.shape().to_vec(),
        self.stride,
      ));
    }
    Ok((h / s, w / s))
  }

  fn cell_state(&self, image: &Array3<f32>, row: usize, col: usize) -> CellState {
    let s = self.stride as usize;
    let area = (s * s) as f32;
    let mut mean = [0.0f32; 3];
    for (ch, m) in mean.iter_mut().enumerate() {
      let patch = image.slice(ndarray::s![ch, row * s..(row + 1) * s, col * s..(col + 1) * s]);
      *m = patch.sum() / area;
    }

    let (mut argmax, mut argmin) = (0usize, 0usize);
    for ch in 1..RGB_CHANNELS {
      if mean[ch] > mean[argmax] {
        argmax = ch;
      }
      if mean[ch] < mean[argmin] {
        argmin = ch;
      }
    }

    let saturation = mean[argmax] - mean[argmin];
    let objectness = sigmoid(self.objectness_gain * saturation - self.objectness_bias);
    let scores = self
      .directions
      .iter()
      .map(|w| {
        let dot = w[0] * mean[0] + w[1] * mean[1] + w[2] * mean[2];
        sigmoid(self.class_gain * dot - self.class_bias)
      })
      .collect();

    CellState {
      argmax,
      argmin,
      objectness,
      scores,
    }
  }

  /// 单元平均颜色的梯度
  fn cell_mean_gradient(&self, state: &CellState, grad: ArrayView1<f32>) -> [f32; 3] {
    let mut dm = [0.0f32; 3];

    let o = state.objectness;
    let dz = grad[4] * o * (1.0 - o) * self.objectness_gain;
    dm[state.argmax] += dz;
    dm[state.argmin] -= dz;

    for (c, (w, &s)) in self.directions.iter().zip(&state.scores).enumerate() {
      let dl = grad[BOX_FIELDS + c] * s * (1.0 - s) * self.class_gain;
      for ch in 0..RGB_CHANNELS {
        dm[ch] += dl * w[ch];
      }
    }
    dm
  }
}

impl Detector for TemplateDetector {
  type Error = TemplateDetectorError;

  fn stride(&self) -> u32 {
    self.stride
  }

  fn mode(&self) -> Mode {
    self.mode
  }

  fn set_mode(&mut self, mode: Mode) {
    self.mode = mode;
  }

  fn forward(&mut self, image: &Array3<f32>) -> Result<RawOutput, Self::Error> {
    let (grid_h, grid_w) = self.grid_size(image)?;
    let (_, h, w) = image.dim();
    let fields = BOX_FIELDS + self.num_classes();
    let s = self.stride as f32;

    let mut output = Array4::<f32>::zeros((1, grid_h, grid_w, fields));
    for row in 0..grid_h {
      for col in 0..grid_w {
        let state = self.cell_state(image, row, col);
        let mut cell: ArrayViewMut1<f32> = output.slice_mut(ndarray::s![0, row, col, ..]);
        cell[0] = 0.5;
        cell[1] = 0.5;
        cell[2] = s / w as f32;
        cell[3] = s / h as f32;
        cell[4] = state.objectness;
        for (c, score) in state.scores.iter().enumerate() {
          cell[BOX_FIELDS + c] = *score;
        }
      }
    }

    debug!("模板检测器前向: 网格 {}x{}", grid_h, grid_w);
    Ok(output.into_dyn())
  }

  fn backward(
    &mut self,
    image: &Array3<f32>,
    output_grad: &RawOutput,
  ) -> Result<Array3<f32>, Self::Error> {
    let (grid_h, grid_w) = self.grid_size(image)?;
    let expected = [1, grid_h, grid_w, BOX_FIELDS + self.num_classes()];
    if output_grad.shape() != expected {
      return Err(TemplateDetectorError::GradientShape(
        output_grad.shape().to_vec(),
        expected.to_vec(),
      ));
    }

    let s = self.stride as usize;
    let area = (s * s) as f32;
    let mut grad = Array3::<f32>::zeros(image.dim());
    for row in 0..grid_h {
      for col in 0..grid_w {
        let state = self.cell_state(image, row, col);
        let cell_grad = output_grad.slice(ndarray::s![0, row, col, ..]);
        let dm = self.cell_mean_gradient(&state, cell_grad);
        for (ch, d) in dm.iter().enumerate() {
          grad
            .slice_mut(ndarray::s![ch, row * s..(row + 1) * s, col * s..(col + 1) * s])
            .fill(d / area);
        }
      }
    }
    Ok(grad)
  }
}
