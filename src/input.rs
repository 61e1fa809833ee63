// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input.rs - 攻击样本输入
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

use std::{num::ParseFloatError, path::Path};

use ndarray::Array3;
use thiserror::Error;

use crate::{BBox, FromUrl};

/// 一张待攻击的图像及其真实框
#[derive(Debug, Clone)]
pub struct AttackSample {
  /// 用于生成输出文件名
  pub name: String,
  pub image: Array3<f32>,
  pub boxes: Vec<BBox>,
}

#[derive(Error, Debug)]
pub enum BoxesError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("真实框文件格式错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("边界框需要 4 个数值: {0}")]
  InvalidBox(String),
  #[error("边界框数值无效: {0}")]
  InvalidNumber(#[from] ParseFloatError),
}

/// 读取 `[[x1, y1, x2, y2], ...]` 格式的真实框文件
pub fn read_boxes(path: impl AsRef<Path>) -> Result<Vec<BBox>, BoxesError> {
  let text = std::fs::read_to_string(path)?;
  Ok(serde_json::from_str(&text)?)
}

/// 解析 `x1,y1,x2,y2`
pub fn parse_box(text: &str) -> Result<BBox, BoxesError> {
  let values = text
    .split(',')
    .map(|v| v.trim().parse::<f32>())
    .collect::<Result<Vec<_>, _>>()?;
  values
    .try_into()
    .map_err(|_| BoxesError::InvalidBox(text.to_string()))
}

/// 文件名去掉扩展名
pub(crate) fn sample_name(path: &Path) -> String {
  path
    .file_stem()
    .map(|stem| stem.to_string_lossy().into_owned())
    .unwrap_or_else(|| "sample".to_string())
}

#[cfg(feature = "read_image_file")]
mod directory;
#[cfg(feature = "read_image_file")]
mod read_image_file;

#[cfg(feature = "read_image_file")]
pub use self::directory::{DirectoryInput, DirectoryInputError};
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError, load_image};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("图像文件输入错误: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "read_image_file")]
  #[error("目录输入错误: {0}")]
  DirectoryInputError(#[from] DirectoryInputError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum InputWrapper {
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "read_image_file")]
  Directory(DirectoryInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
      if url.scheme() == DirectoryInput::SCHEME {
        let input = DirectoryInput::from_url(url)?;
        return Ok(InputWrapper::Directory(input));
      }
    }
    Err(InputError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl Iterator for InputWrapper {
  type Item = AttackSample;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.next(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::Directory(input) => input.next(),
    }
  }
}
