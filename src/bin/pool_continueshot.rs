// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/pool_continueshot.rs - 多线程连续推理
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use shanan_pool::{
  FromUrl,
  input::InputWrapper,
  model::Yolo26PostProcess,
  output::OutputWrapper,
  pool::{CancelToken, PoolBuilder},
  runtime::rknn::RknnRuntime,
  task::{PipelinedTask, Task},
};

/// Shanan 多线程推理参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型, 例如 rknn:///models/yolo26.rknn?workers=3&queue_depth=6
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,

  /// 检测框置信度阈值
  #[arg(long, default_value = "0.25", value_name = "THRESHOLD")]
  pub box_threshold: f32,

  /// NMS IoU 阈值
  #[arg(long, default_value = "0.45", value_name = "THRESHOLD")]
  pub nms_threshold: f32,

  /// 关闭 NMS
  #[arg(long)]
  pub no_nms: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let cancel = CancelToken::new();
  {
    let cancel = cancel.clone();
    ctrlc::set_handler(move || {
      warn!("收到中断信号，准备退出...");
      cancel.cancel();
    })?;
  }

  let post = Yolo26PostProcess::default()
    .box_threshold(args.box_threshold)
    .nms_threshold((!args.no_nms).then_some(args.nms_threshold));

  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;
  let builder = PoolBuilder::from_url(&args.model)?;
  #[cfg(feature = "rga")]
  let builder = builder.resizer(Box::new(shanan_pool::letterbox::RgaResize));
  let pool = builder.build(RknnRuntime::default(), Arc::new(post))?;

  PipelinedTask::default()
    .with_frame_number(args.frame_number)
    .with_cancel(cancel)
    .run_task(input, pool, output)?;

  Ok(())
}
