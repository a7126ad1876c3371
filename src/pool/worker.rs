// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pool/worker.rs - 推理工作线程
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
  panic::{self, AssertUnwindSafe},
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread::{self, JoinHandle},
};

use crossbeam_channel::Receiver;
use tracing::{debug, error, info};

use crate::{
  frame::Frame,
  letterbox::Letterboxer,
  model::{FrameResult, FrameStatus, ModelContext},
  pool::reorder::{ReorderQueue, Ticket},
  runtime::Runtime,
};

/// 取消标记, 在帧与帧之间检查
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

pub(crate) struct Job {
  pub(crate) ticket: Ticket,
  pub(crate) frame: Frame,
}

/// 启动一个独占 `context` 的工作线程
///
/// 线程退出时通过 `JoinHandle` 交还上下文, 由调用方负责释放。
pub(crate) fn spawn_worker<R: Runtime>(
  context: ModelContext<R>,
  jobs: Receiver<Job>,
  results: Arc<ReorderQueue<FrameResult>>,
  letterboxer: Arc<Letterboxer>,
  cancel: CancelToken,
) -> std::io::Result<JoinHandle<ModelContext<R>>> {
  let index = context.index();
  thread::Builder::new()
    .name(format!("shanan-worker-{index}"))
    .spawn(move || run_worker(context, jobs, results, letterboxer, cancel))
}

fn run_worker<R: Runtime>(
  mut context: ModelContext<R>,
  jobs: Receiver<Job>,
  results: Arc<ReorderQueue<FrameResult>>,
  letterboxer: Arc<Letterboxer>,
  cancel: CancelToken,
) -> ModelContext<R> {
  let index = context.index();
  debug!("工作线程 {} 启动", index);
  let mut processed = 0usize;

  while let Ok(Job { ticket, mut frame }) = jobs.recv() {
    if cancel.is_cancelled() {
      results.complete(ticket, FrameResult::passthrough(frame, FrameStatus::Dropped, None));
      break;
    }

    // 后处理 panic 时票号也要完成
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
      context.annotate(&mut frame, &letterboxer)
    }));
    let result = match outcome {
      Ok((detections, status)) => FrameResult {
        frame,
        detections,
        status,
        worker: Some(index),
      },
      Err(_) => {
        error!("工作线程 {}: 处理帧 {} 时发生 panic", index, ticket);
        FrameResult::passthrough(frame, FrameStatus::InferenceFailed, Some(index))
      }
    };
    processed += 1;
    if !results.complete(ticket, result) {
      debug!("工作线程 {}: 票号 {} 的结果已无人领取", index, ticket);
    }
  }

  info!("工作线程 {} 退出, 共处理 {} 帧", index, processed);
  context
}
