// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 任务驱动
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

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::{
  frame::Frame,
  model::{FrameResult, FrameStatus},
  output::Render,
  pool::{CancelToken, RetrieveError, SubmitError, Ticket, WorkerPool},
  runtime::Runtime,
};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

const FPS_WINDOW: usize = 30;
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(1);

/// 流水线任务: 边提交边按顺序取回
#[derive(Debug, Clone)]
pub struct PipelinedTask {
  frame_number: Option<usize>,
  cancel: CancelToken,
  retry_wait: Duration,
  drain_timeout: Duration,
}

impl Default for PipelinedTask {
  fn default() -> Self {
    Self {
      frame_number: None,
      cancel: CancelToken::new(),
      retry_wait: DEFAULT_RETRY_WAIT,
      drain_timeout: DEFAULT_DRAIN_TIMEOUT,
    }
  }
}

impl PipelinedTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
    self.cancel = cancel;
    self
  }

  /// 队列满时等待下一个结果的时间, 之后重试一次
  pub fn with_retry_wait(mut self, wait: Duration) -> Self {
    self.retry_wait = wait;
    self
  }

  /// 输入结束后等待每个剩余结果的时间
  pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
    self.drain_timeout = timeout;
    self
  }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TaskSummary {
  pub submitted: usize,
  pub rendered: usize,
  pub dropped: usize,
  pub undetected: usize,
  /// 输出失败的帧, 不计入 `rendered`
  pub render_failed: usize,
}

struct Progress {
  summary: TaskSummary,
  started: Instant,
  window: Instant,
}

impl Progress {
  fn new() -> Self {
    let now = Instant::now();
    Self {
      summary: TaskSummary::default(),
      started: now,
      window: now,
    }
  }

  fn rendered(&mut self, ticket: Ticket, result: &FrameResult) {
    self.summary.rendered += 1;
    if result.status != FrameStatus::Detected {
      self.summary.undetected += 1;
      debug!("帧 {} 未检测: {:?}", ticket, result.status);
    }

    if self.summary.rendered % FPS_WINDOW == 0 {
      let elapsed = self.window.elapsed().as_secs_f64();
      if elapsed > 0.0 {
        info!("最近 {} 帧 FPS: {:.2}", FPS_WINDOW, FPS_WINDOW as f64 / elapsed);
      }
      self.window = Instant::now();
    }
  }
}

impl PipelinedTask {
  /// 运行并返回统计信息
  pub fn run<R, I, O>(
    self,
    input: I,
    mut pool: WorkerPool<R>,
    output: O,
  ) -> anyhow::Result<TaskSummary>
  where
    R: Runtime,
    I: IntoIterator<Item = Frame>,
    O: Render,
    O::Error: std::error::Error + Send + Sync + 'static,
  {
    info!("开始任务, {} 个工作线程", pool.workers());
    let mut progress = Progress::new();

    for frame in input {
      if self.cancel.is_cancelled() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
      if self
        .frame_number
        .is_some_and(|n| progress.summary.submitted >= n)
      {
        info!("达到指定帧数 {}, 退出任务循环", progress.summary.submitted);
        break;
      }

      let frame = match pool.submit(frame) {
        Ok(_) => None,
        Err(SubmitError::Full(frame)) => Some(frame),
        Err(SubmitError::Closed(_)) => anyhow::bail!("线程池已关闭"),
      };

      match frame {
        None => progress.summary.submitted += 1,
        Some(frame) => {
          // 等队首结果出来, 腾出位置后再试一次
          if let Ok((ticket, result)) = pool.retrieve_timeout(self.retry_wait) {
            render(&output, ticket, result, &mut progress);
          }
          render_ready(&pool, &output, &mut progress);
          match pool.submit(frame) {
            Ok(_) => progress.summary.submitted += 1,
            Err(SubmitError::Full(_)) => {
              progress.summary.dropped += 1;
              warn!("队列已满, 丢弃一帧");
            }
            Err(SubmitError::Closed(_)) => anyhow::bail!("线程池已关闭"),
          }
        }
      }

      render_ready(&pool, &output, &mut progress);
    }

    while pool.outstanding() > 0 {
      match pool.retrieve_timeout(self.drain_timeout) {
        Ok((ticket, result)) => render(&output, ticket, result, &mut progress),
        Err(RetrieveError::NotReady(ticket)) => {
          warn!("等待帧 {} 超时, 放弃剩余 {} 帧", ticket, pool.outstanding());
          break;
        }
        Err(RetrieveError::Empty) | Err(RetrieveError::Closed) => break,
      }
    }

    let released = pool.shutdown();
    let summary = progress.summary;
    let elapsed = progress.started.elapsed().as_secs_f64();
    info!(
      "任务完成: 提交 {} 帧, 输出 {} 帧, 输出失败 {} 帧, 丢弃 {} 帧, 未检测 {} 帧, 释放 {} 个上下文",
      summary.submitted,
      summary.rendered,
      summary.render_failed,
      summary.dropped,
      summary.undetected,
      released
    );
    if elapsed > 0.0 {
      info!("平均 FPS: {:.2}", summary.rendered as f64 / elapsed);
    }

    Ok(summary)
  }
}

impl<R, I, O> Task<I, WorkerPool<R>, O> for PipelinedTask
where
  R: Runtime,
  I: IntoIterator<Item = Frame>,
  O: Render,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, pool: WorkerPool<R>, output: O) -> Result<(), Self::Error> {
    self.run(input, pool, output).map(|_| ())
  }
}

/// 单帧输出失败只记录, 不中断任务
fn render<O>(output: &O, ticket: Ticket, result: FrameResult, progress: &mut Progress)
where
  O: Render,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  match output.render_result(&result.frame, &result.detections) {
    Ok(()) => progress.rendered(ticket, &result),
    Err(e) => {
      progress.summary.render_failed += 1;
      warn!("帧 {} 输出失败: {}", ticket, e);
    }
  }
}

fn render_ready<R, O>(pool: &WorkerPool<R>, output: &O, progress: &mut Progress)
where
  R: Runtime,
  O: Render,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  while let Ok((ticket, result)) = pool.try_retrieve() {
    render(output, ticket, result, progress);
  }
}
