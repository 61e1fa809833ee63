// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/directory.rs - 图像目录输入
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
  path::{Path, PathBuf},
  vec,
};

use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  input::{AttackSample, load_image, read_boxes, sample_name},
  url_path,
};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum DirectoryInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// `folder:///dir`：按文件名顺序逐张读取，`<名称>.json` 为可选的真实框文件
pub struct DirectoryInput {
  files: vec::IntoIter<PathBuf>,
}

impl FromUrlWithScheme for DirectoryInput {
  const SCHEME: &'static str = "folder";
}

fn is_image(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

impl FromUrl for DirectoryInput {
  type Error = DirectoryInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(DirectoryInputError::SchemeMismatch);
    }
    Self::open(url_path(url))
  }
}

impl DirectoryInput {
  pub fn open(directory: impl AsRef<Path>) -> Result<Self, DirectoryInputError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(directory.as_ref())? {
      let path = entry?.path();
      if path.is_file() && is_image(&path) {
        files.push(path);
      }
    }
    files.sort();
    debug!(
      "目录 {} 中共有 {} 张图像",
      directory.as_ref().display(),
      files.len()
    );

    Ok(DirectoryInput {
      files: files.into_iter(),
    })
  }

  fn load(path: &Path) -> Option<AttackSample> {
    let image = match load_image(path) {
      Ok(image) => image,
      Err(e) => {
        error!("无法读取图像 {}: {}", path.display(), e);
        return None;
      }
    };

    let sidecar = path.with_extension("json");
    let boxes = if sidecar.is_file() {
      read_boxes(&sidecar).unwrap_or_else(|e| {
        warn!("忽略无法解析的真实框文件 {}: {}", sidecar.display(), e);
        Vec::new()
      })
    } else {
      Vec::new()
    };

    Some(AttackSample {
      name: sample_name(path),
      image,
      boxes,
    })
  }
}

impl Iterator for DirectoryInput {
  type Item = AttackSample;

  fn next(&mut self) -> Option<Self::Item> {
    self.files.by_ref().find_map(|path| Self::load(&path))
  }
}
