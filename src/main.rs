// 该文件是 Shanan （山南西风） 项目的一部分。
// src/main.rs - 对抗扰动命令行入口
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

mod args;

use anyhow::{Result, bail};
use clap::Parser;
use shanan_attack::{
  FromUrl, FromUrlWithScheme,
  input::InputWrapper,
  model::{DetectorOracleBuilder, TemplateDetectorBuilder},
  output::OutputWrapper,
  task::{BatchAttackTask, Task},
};
use tracing::info;

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let config = args.attack_config()?;
  info!("攻击参数: {:?}", config);

  let detector = match args.model.scheme() {
    TemplateDetectorBuilder::SCHEME => TemplateDetectorBuilder::from_url(&args.model)?.build(),
    other => bail!("不支持的模型类型: {}", other),
  };
  let oracle = DetectorOracleBuilder::from_url(&args.model)?.build(detector);

  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  BatchAttackTask::new(config)
    .with_sample_limit(args.sample_limit)
    .with_interrupt_handler(true)
    .run_task(input, oracle, output)?;

  Ok(())
}
