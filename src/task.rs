// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 批量攻击任务
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

use anyhow::Context;
use tracing::{info, warn};

use crate::{
  attack::{AttackConfig, AttackController, AttackResult, CancelToken, StopReason},
  input::AttackSample,
  model::DetectionOracle,
  output::Render,
};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

/// 对输入中的每张图像依次执行攻击并输出结果
#[derive(Debug, Clone, Default)]
pub struct BatchAttackTask {
  config: AttackConfig,
  sample_limit: Option<usize>,
  cancel: CancelToken,
  handle_interrupt: bool,
}

impl BatchAttackTask {
  pub fn new(config: AttackConfig) -> Self {
    Self {
      config,
      ..Default::default()
    }
  }

  pub fn with_sample_limit(mut self, sample_limit: Option<usize>) -> Self {
    self.sample_limit = sample_limit;
    self
  }

  pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
    self.cancel = cancel;
    self
  }

  /// 收到 Ctrl-C 时在当前迭代结束后停止
  pub fn with_interrupt_handler(mut self, handle_interrupt: bool) -> Self {
    self.handle_interrupt = handle_interrupt;
    self
  }

  fn install_interrupt_handler(&self) -> anyhow::Result<()> {
    let cancel = self.cancel.clone();
    ctrlc::set_handler(move || {
      warn!("收到中断信号，当前迭代结束后停止攻击");
      cancel.cancel();
    })
    .context("无法设置 Ctrl-C 处理函数")
  }

  fn sample_config(&self, sample: &AttackSample) -> AttackConfig {
    if sample.boxes.is_empty() {
      self.config.clone()
    } else {
      self.config.clone().with_ground_truth(sample.boxes.clone())
    }
  }
}

impl<I, M, O, RE> Task<I, M, O> for BatchAttackTask
where
  I: Iterator<Item = AttackSample>,
  M: DetectionOracle,
  O: Render<AttackSample, AttackResult, Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    if self.handle_interrupt {
      self.install_interrupt_handler()?;
    }

    let mut processed = 0usize;
    let mut suppressed = 0usize;
    for sample in input {
      if self.cancel.is_cancelled() {
        warn!("任务已取消，跳过剩余样本");
        break;
      }

      info!("攻击样本 {} ({} 个真实框)", sample.name, sample.boxes.len());
      let now = std::time::Instant::now();
      let result = AttackController::new(&model, self.sample_config(&sample))
        .with_cancel_token(self.cancel.clone())
        .with_sink(|record| {
          info!(
            "[{}] 迭代 {}: 检测 {} 个, 损失 {:.5}, 扰动 {:.4}",
            sample.name,
            record.iteration,
            record.detection_count,
            record.loss,
            record.perturbation_magnitude
          )
        })
        .run(&sample.image)
        .with_context(|| format!("样本 {} 攻击失败", sample.name))?;
      info!(
        "样本 {} 完成: {}, 检测 {} -> {}, 耗时 {:.2?}",
        sample.name,
        result.stop_reason,
        result.initial_detections,
        result.final_detections,
        now.elapsed()
      );

      output
        .render_result(&sample, &result)
        .with_context(|| format!("样本 {} 输出失败", sample.name))?;

      processed += 1;
      if result.stop_reason.is_success() {
        suppressed += 1;
      }
      if result.stop_reason == StopReason::Cancelled {
        break;
      }
      if self.sample_limit.is_some_and(|n| processed >= n) {
        info!("达到指定样本数 {}, 退出任务循环", processed);
        break;
      }
    }

    info!("任务完成: 处理 {} 个样本, 成功抑制 {} 个", processed, suppressed);
    Ok(())
  }
}
