// 该文件是 Shanan （山南西风） 项目的一部分。
// src/args.rs - 命令行参数
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

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use shanan_attack::{attack::AttackConfig, model::labels::parse_class, output::IMAGE_RANGE};
use url::Url;

/// 针对目标检测器的迭代对抗扰动
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型，例如 template://?stride=32&classes=3&loss=full
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，image:///a.png?box=x1,y1,x2,y2 或 folder:///dir
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径，image:///out.png 或 folder:///dir?perturbation
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  /// JSON 格式的攻击参数文件，命令行参数优先
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,

  #[arg(long, value_name = "EPSILON")]
  pub epsilon: Option<f32>,
  #[arg(long, value_name = "STEP")]
  pub step_size: Option<f32>,
  #[arg(long, value_name = "COUNT")]
  pub max_iterations: Option<usize>,
  #[arg(long, value_name = "RATIO")]
  pub stop_threshold: Option<f32>,
  #[arg(long, value_name = "NCC")]
  pub similarity_threshold: Option<f32>,
  /// 目标类别，类别编号或 COCO 类别名
  #[arg(long, value_name = "CLASS")]
  pub target_class: Option<String>,
  #[arg(long, value_name = "COUNT")]
  pub report_every: Option<usize>,

  /// 最多处理的样本数
  #[arg(long, value_name = "COUNT")]
  pub sample_limit: Option<usize>,
}

impl Args {
  /// 读取参数文件并应用命令行覆盖
  pub fn attack_config(&self) -> Result<AttackConfig> {
    let mut config = match &self.config {
      Some(path) => {
        let text = std::fs::read_to_string(path)
          .with_context(|| format!("无法读取参数文件: {}", path.display()))?;
        serde_json::from_str(&text)
          .with_context(|| format!("参数文件格式错误: {}", path.display()))?
      }
      None => AttackConfig::default(),
    };

    if let Some(epsilon) = self.epsilon {
      config.epsilon = epsilon;
    }
    if let Some(step_size) = self.step_size {
      config.initial_step_size = step_size;
    }
    if let Some(max_iterations) = self.max_iterations {
      config.max_iterations = max_iterations;
    }
    if let Some(stop_threshold) = self.stop_threshold {
      config.stop_threshold = stop_threshold;
    }
    if let Some(similarity_threshold) = self.similarity_threshold {
      config.similarity_threshold = similarity_threshold;
    }
    if let Some(report_every) = self.report_every {
      config.report_every = report_every;
    }
    if let Some(target) = &self.target_class {
      let class = parse_class(target).ok_or_else(|| anyhow!("未知的目标类别: {}", target))?;
      config.target_class = Some(class);
    }

    config.validate()?;
    let [lo, hi] = config.valid_range;
    if lo < IMAGE_RANGE[0] || hi > IMAGE_RANGE[1] {
      bail!(
        "取值范围 [{}, {}] 超出图像像素范围 [{}, {}]",
        lo,
        hi,
        IMAGE_RANGE[0],
        IMAGE_RANGE[1]
      );
    }
    Ok(config)
  }
}
