// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/read_image_file.rs - 单张图像文件输入
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

use std::path::Path;

use image::ImageReader;
use ndarray::Array3;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  BBox, FromUrl, FromUrlWithScheme,
  frame::RgbNchwFrame,
  input::{AttackSample, BoxesError, parse_box, read_boxes, sample_name},
  url_path,
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("真实框错误: {0}")]
  BoxesError(#[from] BoxesError),
}

/// 读取图像并转换为 [0, 1] 范围的 (3, H, W) 张量
pub fn load_image(path: impl AsRef<Path>) -> Result<Array3<f32>, ImageFileInputError> {
  let image = ImageReader::open(path)?.decode()?.to_rgb8();
  Ok(RgbNchwFrame::from(&image).into_array())
}

/// `image:///path.png?boxes=/path.json&box=x1,y1,x2,y2`
pub struct ImageFileInput {
  sample: Option<AttackSample>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch);
    }

    let path = url_path(url);
    let mut boxes: Vec<BBox> = Vec::new();
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "boxes" => boxes.extend(read_boxes(&*v)?),
        "box" => boxes.push(parse_box(&v)?),
        _ => {}
      }
    }

    let image = load_image(&path)?;
    info!(
      "读取图像 {} ({:?}), 真实框 {} 个",
      path,
      image.shape(),
      boxes.len()
    );

    Ok(ImageFileInput {
      sample: Some(AttackSample {
        name: sample_name(Path::new(&path)),
        image,
        boxes,
      }),
    })
  }
}

impl Iterator for ImageFileInput {
  type Item = AttackSample;

  fn next(&mut self) -> Option<Self::Item> {
    self.sample.take()
  }
}
