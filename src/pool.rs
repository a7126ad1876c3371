// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pool.rs - 并行推理线程池
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

//! 推理线程池
//!
//! 线程池持有 N 个模型上下文: 0 号从磁盘加载权重, 其余复制自 0 号。
//! 每个上下文由一个工作线程独占, 帧按票号轮询分发, 结果经重排队列按提交顺序取回。

use std::{
  num::NonZeroUsize,
  path::{Path, PathBuf},
  str::FromStr,
  sync::Arc,
  thread::{self, JoinHandle},
  time::Duration,
};

use crossbeam_channel::{Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  letterbox::{Letterboxer, Resize},
  model::{ContextError, FrameResult, FrameStatus, ModelContext, ModelMeta, PostProcess},
  output::draw::{Draw, DrawError, load_font},
  runtime::Runtime,
};

pub mod reorder;
mod worker;

pub use self::reorder::{ReorderQueue, ReserveError, RetrieveError, Ticket};
pub use self::worker::CancelToken;
use self::worker::{Job, spawn_worker};

/// 覆盖工作线程数量的环境变量
pub const THREADS_ENV: &str = "RKNN_THREADS";
/// 单个 NPU 上的工作线程上限
pub const MAX_WORKERS_PER_NPU: usize = 6;

/// 根据 CPU 核数估算工作线程数量
///
/// 预留四分之一的核 (至少 2 个) 给系统, 剩余的在同时运行的 `instances` 个进程之间平分,
/// 结果在 1 到 [`MAX_WORKERS_PER_NPU`] 之间。
pub fn optimal_worker_count(total_cores: usize, instances: usize) -> usize {
  let reserved = (total_cores / 4).max(2);
  let available = total_cores.saturating_sub(reserved);
  (available / instances.max(1)).clamp(1, MAX_WORKERS_PER_NPU)
}

/// 单进程时的默认工作线程数量
pub fn default_worker_count() -> usize {
  worker_count_for_instances(1)
}

/// `RKNN_THREADS` 优先, 否则按本机核数估算
pub fn worker_count_for_instances(instances: usize) -> usize {
  if let Ok(value) = std::env::var(THREADS_ENV) {
    match value.trim().parse::<usize>() {
      Ok(count) if count > 0 => {
        info!("工作线程数量由环境变量 {} 指定: {}", THREADS_ENV, count);
        return count;
      }
      _ => warn!("忽略无效的环境变量 {}={}", THREADS_ENV, value),
    }
  }

  let cores = thread::available_parallelism()
    .map(NonZeroUsize::get)
    .unwrap_or(1);
  let count = optimal_worker_count(cores, instances);
  debug!(
    "检测到 {} 个 CPU 核, {} 个实例, 使用 {} 个工作线程",
    cores, instances, count
  );
  count
}

#[derive(Error, Debug)]
pub enum PoolError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("参数 {key} 无效: {value}")]
  InvalidParam { key: String, value: String },
  #[error("工作线程数量必须至少为 1")]
  NoWorkers,
  #[error("标注字体加载失败: {0}")]
  Font(#[from] DrawError),
  #[error("上下文 {index} 创建失败: {source}")]
  Context {
    index: usize,
    #[source]
    source: ContextError,
  },
  #[error("无法启动工作线程 {index}: {source}")]
  Spawn {
    index: usize,
    #[source]
    source: std::io::Error,
  },
}

/// 提交失败, 帧原样交还给调用方
#[derive(Error, Debug)]
pub enum SubmitError {
  #[error("队列已满")]
  Full(Frame),
  #[error("线程池已关闭")]
  Closed(Frame),
}

impl SubmitError {
  pub fn into_frame(self) -> Frame {
    match self {
      SubmitError::Full(frame) | SubmitError::Closed(frame) => frame,
    }
  }
}

/// 线程池配置
pub struct PoolBuilder {
  model_path: PathBuf,
  workers: Option<usize>,
  instances: usize,
  queue_depth: Option<usize>,
  fill: u8,
  font: Option<PathBuf>,
  accelerators: Vec<Box<dyn Resize>>,
}

impl FromUrlWithScheme for PoolBuilder {
  const SCHEME: &'static str = "rknn";
}

impl FromUrl for PoolBuilder {
  type Error = PoolError;

  /// `rknn:///path/to/model.rknn?workers=3&queue_depth=8&fill=114&instances=1&font=/path/to/font.ttf`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(PoolError::SchemeMismatch(format!(
        "期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let mut builder = PoolBuilder::new(url.path());
    for (key, value) in url.query_pairs() {
      builder = match key.as_ref() {
        "workers" => builder.workers(parse_param(&key, &value)?),
        "instances" => builder.instances(parse_param(&key, &value)?),
        "queue_depth" => builder.queue_depth(parse_param(&key, &value)?),
        "fill" => builder.fill_value(parse_param(&key, &value)?),
        "font" => builder.font(&*value),
        _ => {
          warn!("忽略未知参数 {}={}", key, value);
          builder
        }
      };
    }
    Ok(builder)
  }
}

fn parse_param<T: FromStr>(key: &str, value: &str) -> Result<T, PoolError> {
  value.parse().map_err(|_| PoolError::InvalidParam {
    key: key.to_string(),
    value: value.to_string(),
  })
}

impl PoolBuilder {
  pub fn new(model_path: impl AsRef<Path>) -> Self {
    Self {
      model_path: model_path.as_ref().to_path_buf(),
      workers: None,
      instances: 1,
      queue_depth: None,
      fill: 0,
      font: None,
      accelerators: Vec::new(),
    }
  }

  /// 工作线程数量, 不指定时见 [`worker_count_for_instances`]
  pub fn workers(mut self, workers: usize) -> Self {
    self.workers = Some(workers);
    self
  }

  /// 同时运行、共享 NPU 的进程数量
  pub fn instances(mut self, instances: usize) -> Self {
    self.instances = instances.max(1);
    self
  }

  /// 未取走结果的上限, 默认为工作线程数量的两倍
  pub fn queue_depth(mut self, depth: usize) -> Self {
    self.queue_depth = Some(depth);
    self
  }

  pub fn fill_value(mut self, fill: u8) -> Self {
    self.fill = fill;
    self
  }

  /// 检测框标注所用的字体文件, 不设置时只画框
  pub fn font(mut self, path: impl AsRef<Path>) -> Self {
    self.font = Some(path.as_ref().to_path_buf());
    self
  }

  /// 加一个加速缩放实现, 失败时回退到软件缩放
  pub fn resizer(mut self, resize: Box<dyn Resize>) -> Self {
    self.accelerators.push(resize);
    self
  }

  pub fn model_path(&self) -> &Path {
    &self.model_path
  }

  /// 创建全部上下文并启动工作线程
  ///
  /// 任意一个上下文创建失败都会让整个构建失败, 已创建的上下文全部释放。
  pub fn build<R: Runtime>(
    self,
    runtime: R,
    post: Arc<dyn PostProcess>,
  ) -> Result<WorkerPool<R>, PoolError> {
    let workers = match self.workers {
      Some(0) => return Err(PoolError::NoWorkers),
      Some(workers) => workers,
      None => worker_count_for_instances(self.instances),
    };
    let queue_depth = self.queue_depth.unwrap_or(workers * 2).max(1);
    info!(
      "创建推理线程池: {} 个工作线程, 队列深度 {}",
      workers, queue_depth
    );

    let font = self.font.as_deref().map(load_font).transpose()?;
    let draw = Draw::default().font(font);

    let runtime = Arc::new(runtime);
    let mut root = ModelContext::load(runtime, &self.model_path, post)
      .map_err(|source| PoolError::Context { index: 0, source })?;
    root.set_draw(draw);

    let mut contexts = Vec::with_capacity(workers);
    for index in 1..workers {
      let context = root
        .duplicate(index)
        .map_err(|source| PoolError::Context { index, source })?;
      contexts.push(context);
    }
    contexts.insert(0, root);

    let meta = contexts[0].meta().clone();
    let letterboxer = Arc::new(
      self
        .accelerators
        .into_iter()
        .fold(Letterboxer::new(self.fill), Letterboxer::with_accelerator),
    );
    debug!("预处理策略: {:?}", letterboxer.strategy_names());

    let mut pool = WorkerPool {
      senders: Vec::with_capacity(workers),
      handles: Vec::with_capacity(workers),
      results: Arc::new(ReorderQueue::new(queue_depth)),
      cancel: CancelToken::new(),
      meta,
      workers,
    };

    for context in contexts {
      let index = context.index();
      // 通道容量不小于未取走票号的上限, 发送不会因为通道满而失败
      let (sender, receiver) = crossbeam_channel::bounded(queue_depth);
      let handle = spawn_worker(
        context,
        receiver,
        pool.results.clone(),
        letterboxer.clone(),
        pool.cancel.clone(),
      )
      .map_err(|source| PoolError::Spawn { index, source })?;
      pool.senders.push(sender);
      pool.handles.push(handle);
    }

    info!("推理线程池就绪");
    Ok(pool)
  }
}

/// 并行推理线程池
pub struct WorkerPool<R: Runtime> {
  senders: Vec<Sender<Job>>,
  handles: Vec<JoinHandle<ModelContext<R>>>,
  results: Arc<ReorderQueue<FrameResult>>,
  cancel: CancelToken,
  meta: ModelMeta,
  workers: usize,
}

impl<R: Runtime> WorkerPool<R> {
  /// 提交一帧, 返回其票号
  ///
  /// 未取走的结果达到队列深度时立即返回 [`SubmitError::Full`], 不会阻塞。
  pub fn submit(&self, frame: Frame) -> Result<Ticket, SubmitError> {
    let ticket = match self.results.reserve() {
      Ok(ticket) => ticket,
      Err(ReserveError::Full(_)) => return Err(SubmitError::Full(frame)),
      Err(ReserveError::Closed) => return Err(SubmitError::Closed(frame)),
    };

    let worker = (ticket.0 % self.workers as u64) as usize;
    let job = Job { ticket, frame };
    let rejected = match self.senders.get(worker) {
      Some(sender) => match sender.try_send(job) {
        Ok(()) => None,
        Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => Some(job),
      },
      None => Some(job),
    };

    // 工作线程不可用时仍然占住票号, 以透传结果保持顺序
    if let Some(job) = rejected {
      warn!("工作线程 {} 不可用, 帧 {} 直接透传", worker, ticket);
      self.results.complete(
        job.ticket,
        FrameResult::passthrough(job.frame, FrameStatus::Dropped, None),
      );
    }

    debug!("帧 {} 分发到工作线程 {}", ticket, worker);
    Ok(ticket)
  }

  /// 非阻塞地取下一个结果
  pub fn try_retrieve(&self) -> Result<(Ticket, FrameResult), RetrieveError> {
    self.results.try_pop()
  }

  /// 等待下一个结果至多 `timeout`
  pub fn retrieve_timeout(
    &self,
    timeout: Duration,
  ) -> Result<(Ticket, FrameResult), RetrieveError> {
    self.results.pop_timeout(timeout)
  }

  /// 已提交但尚未取走的帧数
  pub fn outstanding(&self) -> usize {
    self.results.outstanding()
  }

  pub fn workers(&self) -> usize {
    self.workers
  }

  pub fn queue_depth(&self) -> usize {
    self.results.capacity()
  }

  pub fn meta(&self) -> &ModelMeta {
    &self.meta
  }

  pub fn is_shut_down(&self) -> bool {
    self.senders.is_empty() && self.handles.is_empty()
  }

  /// 停止所有工作线程并释放全部上下文
  ///
  /// 未取走的结果被丢弃。等待每个线程完成当前这一帧后再释放其上下文。
  /// 重复调用无副作用, 返回本次释放的上下文数量。
  pub fn shutdown(&mut self) -> usize {
    if self.is_shut_down() {
      return 0;
    }

    info!("关闭推理线程池");
    self.cancel.cancel();
    let discarded = self.results.close();
    if discarded > 0 {
      warn!("丢弃 {} 个未取走的结果", discarded);
    }
    self.senders.clear();

    let mut released = 0;
    for handle in self.handles.drain(..) {
      match handle.join() {
        Ok(mut context) => {
          if context.teardown() {
            released += 1;
          }
        }
        Err(_) => error!("工作线程异常退出"),
      }
    }

    info!("推理线程池已关闭, 释放 {} 个上下文", released);
    released
  }
}

impl<R: Runtime> Drop for WorkerPool<R> {
  fn drop(&mut self) {
    self.shutdown();
  }
}
