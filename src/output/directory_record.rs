// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/directory_record.rs - 按日期归档攻击结果
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

use std::path::{Path, PathBuf};

use chrono::{Datelike, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::{
  FromUrl, FromUrlWithScheme,
  attack::{AttackResult, IterationRecord, StopReason},
  frame::{RgbNchwFrame, perturbation_image},
  input::AttackSample,
  output::{IMAGE_RANGE, Render},
  url_path,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("报告序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 写入 `<名称>.json` 的攻击报告
#[derive(Debug, Serialize)]
pub struct AttackReport<'a> {
  pub name: &'a str,
  pub stop_reason: StopReason,
  pub stop_iteration: Option<usize>,
  pub iterations: usize,
  pub initial_detections: usize,
  pub final_detections: usize,
  pub max_perturbation: f32,
  pub ground_truth: &'a [crate::BBox],
  pub trace: &'a [IterationRecord],
}

impl<'a> AttackReport<'a> {
  pub fn new(sample: &'a AttackSample, result: &'a AttackResult) -> Self {
    Self {
      name: &sample.name,
      stop_reason: result.stop_reason,
      stop_iteration: result.stop_iteration,
      iterations: result.iterations,
      initial_detections: result.initial_detections,
      final_detections: result.final_detections,
      max_perturbation: result.max_perturbation(),
      ground_truth: &sample.boxes,
      trace: &result.trace,
    }
  }
}

/// `folder:///dir[?perturbation]`
///
/// 结果写入 `dir/YYYY/MM/DD/`：`<名称>-adv.png`、`<名称>.json`，
/// 指定 `perturbation` 时额外写入 `<名称>-perturbation.png`。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  perturbation: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let perturbation = uri.query_pairs().any(|(k, _)| k == "perturbation");

    Ok(Self::new(url_path(uri), perturbation))
  }
}

impl DirectoryRecordOutput {
  pub fn new(directory: impl AsRef<Path>, perturbation: bool) -> Self {
    Self {
      directory: directory.as_ref().to_path_buf(),
      perturbation,
    }
  }

  fn dated_directory(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }
    Ok(directory)
  }
}

impl Render<AttackSample, AttackResult> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, sample: &AttackSample, result: &AttackResult) -> Result<(), Self::Error> {
    let directory = self.dated_directory()?;

    let adversarial = RgbNchwFrame::from(result.apply_to(&sample.image));
    adversarial
      .to_rgb_image(IMAGE_RANGE)
      .save(directory.join(format!("{}-adv.png", sample.name)))?;

    if self.perturbation {
      perturbation_image(&result.perturbation, result.max_perturbation())
        .save(directory.join(format!("{}-perturbation.png", sample.name)))?;
    }

    let report = serde_json::to_string_pretty(&AttackReport::new(sample, result))?;
    std::fs::write(directory.join(format!("{}.json", sample.name)), report)?;

    info!("攻击结果已记录到 {}", directory.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::Array3;

  #[test]
  fn records_are_written_into_dated_directories() {
    let root = std::env::temp_dir().join(format!("shanan-attack-record-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&root);
    let url = url::Url::parse(&format!("folder://{}?perturbation", root.display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();

    let sample = AttackSample {
      name: "cat".to_string(),
      image: Array3::from_elem((3, 4, 4), 0.5),
      boxes: vec![[0.0, 0.0, 2.0, 2.0]],
    };
    let result = AttackResult {
      perturbation: Array3::from_elem((3, 4, 4), 0.02),
      stop_reason: StopReason::Suppressed,
      stop_iteration: Some(3),
      iterations: 4,
      initial_detections: 2,
      final_detections: 0,
      trace: Vec::new(),
      valid_range: [0.0, 1.0],
    };
    output.render_result(&sample, &result).unwrap();

    let directory = output.dated_directory().unwrap();
    assert!(directory.join("cat-adv.png").is_file());
    assert!(directory.join("cat-perturbation.png").is_file());
    let report: serde_json::Value =
      serde_json::from_str(&std::fs::read_to_string(directory.join("cat.json")).unwrap()).unwrap();
    assert_eq!(report["stop_reason"], "suppressed");
    assert_eq!(report["stop_iteration"], 3);
    assert_eq!(report["final_detections"], 0);

    std::fs::remove_dir_all(&root).unwrap();
  }
}
