// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/layout.rs - 检测器输出布局解析
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

use std::borrow::Cow;

use tracing::debug;

use crate::{
  BBox,
  model::{Detection, RawOutput},
};

/// 每个候选框的基础字段数: x, y, w, h, objectness
const BOX_FIELDS: usize = 5;
/// 后处理结果每行字段数: x1, y1, x2, y2, score, class
const POST_PROCESSED_FIELDS: usize = 6;

/// 解析所需的上下文
#[derive(Debug, Clone, Copy)]
pub struct ParseContext {
  /// 输入图像尺寸 (高, 宽)
  pub image_size: (usize, usize),
}

/// 类别分数的选取方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassSelect {
  /// 取分数最高的类别
  Argmax,
  /// 取指定类别
  Fixed(u32),
}

impl From<Option<u32>> for ClassSelect {
  fn from(target: Option<u32>) -> Self {
    target.map_or(ClassSelect::Argmax, ClassSelect::Fixed)
  }
}

/// 原始输出中的一个候选框，保留其在扁平数据中的索引以便回传梯度
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
  pub bbox: BBox,
  pub objectness: f32,
  pub objectness_index: usize,
  pub class_id: u32,
  pub class_score: f32,
  /// 类别分数在扁平数据中的索引；后处理输出没有独立的类别分数
  pub class_index: Option<usize>,
}

impl Candidate {
  pub fn confidence(&self) -> f32 {
    self.objectness * self.class_score
  }
}

pub trait ParseDetections {
  /// 逐个枚举候选框，`data` 为标准行优先布局的扁平数据
  fn candidates(&self, data: &[f32], ctx: &ParseContext, select: ClassSelect) -> Vec<Candidate>;

  fn parse_detections(&self, data: &[f32], ctx: &ParseContext, threshold: f32) -> Vec<Detection> {
    self
      .candidates(data, ctx, ClassSelect::Argmax)
      .into_iter()
      .filter(|c| c.objectness >= threshold && c.confidence() >= threshold)
      .map(|c| Detection {
        bbox: c.bbox,
        class_id: c.class_id,
        objectness: c.objectness,
        class_score: c.class_score,
      })
      .collect()
  }
}

/// 网格输出 `[1, grid_h, grid_w, 5 + C]`
///
/// x, y 为相对网格单元左上角的偏移，w, h 相对整幅图像归一化。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridOutput {
  pub grid_h: usize,
  pub grid_w: usize,
  pub num_classes: usize,
}

/// 扁平锚框输出 `[1, A, 5 + C]`，x, y, w, h 为绝对像素坐标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatAnchorOutput {
  pub num_anchors: usize,
  pub num_classes: usize,
}

/// 已后处理的检测列表 `[N, 6]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostProcessedBoxList {
  pub num_boxes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
  Grid(GridOutput),
  FlatAnchor(FlatAnchorOutput),
  PostProcessedBoxList(PostProcessedBoxList),
}

impl OutputLayout {
  /// 根据输出张量声明的形状选择布局
  pub fn from_shape(shape: &[usize]) -> Option<Self> {
    match *shape {
      [1, grid_h, grid_w, fields] if fields > BOX_FIELDS && grid_h > 0 && grid_w > 0 => {
        Some(OutputLayout::Grid(GridOutput {
          grid_h,
          grid_w,
          num_classes: fields - BOX_FIELDS,
        }))
      }
      [1, num_anchors, fields] if fields > BOX_FIELDS => {
        Some(OutputLayout::FlatAnchor(FlatAnchorOutput {
          num_anchors,
          num_classes: fields - BOX_FIELDS,
        }))
      }
      [num_boxes, POST_PROCESSED_FIELDS] => {
        Some(OutputLayout::PostProcessedBoxList(PostProcessedBoxList { num_boxes }))
      }
      _ => None,
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      OutputLayout::Grid(_) => "grid",
      OutputLayout::FlatAnchor(_) => "flat-anchor",
      OutputLayout::PostProcessedBoxList(_) => "post-processed",
    }
  }

  /// 输出是否包含逐锚框的置信度（可参与完整检测损失）
  pub fn has_dense_scores(&self) -> bool {
    !matches!(self, OutputLayout::PostProcessedBoxList(_))
  }
}

impl ParseDetections for OutputLayout {
  fn candidates(&self, data: &[f32], ctx: &ParseContext, select: ClassSelect) -> Vec<Candidate> {
    match self {
      OutputLayout::Grid(layout) => layout.candidates(data, ctx, select),
      OutputLayout::FlatAnchor(layout) => layout.candidates(data, ctx, select),
      OutputLayout::PostProcessedBoxList(layout) => layout.candidates(data, ctx, select),
    }
  }
}

/// 返回标准行优先布局的扁平数据
pub fn standard_data(output: &RawOutput) -> Cow<'_, [f32]> {
  match output.as_slice() {
    Some(slice) => Cow::Borrowed(slice),
    None => Cow::Owned(output.iter().copied().collect()),
  }
}

/// 在类别分数区间中选取类别，返回 (类别, 分数, 扁平索引)
fn select_class(
  data: &[f32],
  class_base: usize,
  num_classes: usize,
  select: ClassSelect,
) -> Option<(u32, f32, usize)> {
  match select {
    ClassSelect::Fixed(class_id) => {
      let c = class_id as usize;
      (c < num_classes).then(|| (class_id, data[class_base + c], class_base + c))
    }
    ClassSelect::Argmax => {
      let mut best: Option<(u32, f32, usize)> = None;
      for c in 0..num_classes {
        let score = data[class_base + c];
        if best.is_none_or(|(_, s, _)| score > s) {
          best = Some((c as u32, score, class_base + c));
        }
      }
      best
    }
  }
}

impl ParseDetections for GridOutput {
  fn candidates(&self, data: &[f32], ctx: &ParseContext, select: ClassSelect) -> Vec<Candidate> {
    let fields = BOX_FIELDS + self.num_classes;
    if data.len() != self.grid_h * self.grid_w * fields {
      debug!(
        "网格输出数据长度不匹配: 期望 {}, 实际 {}",
        self.grid_h * self.grid_w * fields,
        data.len()
      );
      return Vec::new();
    }

    let (img_h, img_w) = (ctx.image_size.0 as f32, ctx.image_size.1 as f32);
    let stride_y = img_h / self.grid_h as f32;
    let stride_x = img_w / self.grid_w as f32;

    let mut items = Vec::new();
    for row in 0..self.grid_h {
      for col in 0..self.grid_w {
        let base = (row * self.grid_w + col) * fields;
        let Some((class_id, class_score, class_index)) =
          select_class(data, base + BOX_FIELDS, self.num_classes, select)
        else {
          continue;
        };

        // 解码边界框
        let cx = (col as f32 + data[base]) * stride_x;
        let cy = (row as f32 + data[base + 1]) * stride_y;
        let w = data[base + 2] * img_w;
        let h = data[base + 3] * img_h;

        items.push(Candidate {
          bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
          objectness: data[base + 4],
          objectness_index: base + 4,
          class_id,
          class_score,
          class_index: Some(class_index),
        });
      }
    }
    items
  }
}

impl ParseDetections for FlatAnchorOutput {
  fn candidates(&self, data: &[f32], _ctx: &ParseContext, select: ClassSelect) -> Vec<Candidate> {
    let fields = BOX_FIELDS + self.num_classes;
    if data.len() != self.num_anchors * fields {
      debug!(
        "锚框输出数据长度不匹配: 期望 {}, 实际 {}",
        self.num_anchors * fields,
        data.len()
      );
      return Vec::new();
    }

    (0..self.num_anchors)
      .filter_map(|anchor| {
        let base = anchor * fields;
        let (class_id, class_score, class_index) =
          select_class(data, base + BOX_FIELDS, self.num_classes, select)?;
        let (cx, cy, w, h) = (data[base], data[base + 1], data[base + 2], data[base + 3]);
        Some(Candidate {
          bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
          objectness: data[base + 4],
          objectness_index: base + 4,
          class_id,
          class_score,
          class_index: Some(class_index),
        })
      })
      .collect()
  }
}

impl ParseDetections for PostProcessedBoxList {
  fn candidates(&self, data: &[f32], _ctx: &ParseContext, select: ClassSelect) -> Vec<Candidate> {
    if data.len() != self.num_boxes * POST_PROCESSED_FIELDS {
      return Vec::new();
    }

    data
      .chunks_exact(POST_PROCESSED_FIELDS)
      .enumerate()
      .filter_map(|(idx, row)| {
        let class_value = row[5];
        if !class_value.is_finite() || class_value < 0.0 {
          return None;
        }
        let class_id = class_value.round() as u32;
        if let ClassSelect::Fixed(target) = select
          && target != class_id
        {
          return None;
        }
        Some(Candidate {
          bbox: [row[0], row[1], row[2], row[3]],
          objectness: row[4],
          objectness_index: idx * POST_PROCESSED_FIELDS + 4,
          class_id,
          class_score: 1.0,
          class_index: None,
        })
      })
      .collect()
  }
}
