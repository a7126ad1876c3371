// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/common/mod.rs - 测试用运行时
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

#![allow(dead_code)]

use std::{
  collections::HashSet,
  io::Write,
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
  thread,
  time::Duration,
};

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use shanan_pool::{
  frame::{Frame, PixelFormat},
  model::{DetectItem, DetectResult, ModelMeta, PostProcess},
  runtime::{
    IoNum, QuantType, RawOutputs, Runtime, RuntimeError, TensorAttr, TensorFormat, TensorType,
  },
};

pub const MODEL_SIZE: u32 = 64;

/// 在哪个句柄的第几次属性查询上失败
#[derive(Debug, Clone, Copy)]
pub struct QueryFailure {
  /// 句柄创建顺序, 0 为根句柄
  pub handle: usize,
  /// 从 1 开始计数
  pub at: usize,
}

#[derive(Default)]
pub struct Script {
  pub fail_load: bool,
  /// 第几次复制失败, 从 1 开始计数
  pub fail_duplicate_at: Option<usize>,
  pub fail_query: Option<QueryFailure>,
  /// 标记值等于该值的帧推理失败
  pub fail_run_tag: Option<u8>,
  /// 根据标记值和句柄序号决定推理耗时
  pub latency: Option<fn(u8, usize) -> Duration>,
}

#[derive(Default)]
pub struct Counters {
  pub created: AtomicUsize,
  pub released: AtomicUsize,
  pub double_released: AtomicUsize,
  pub duplicate_calls: AtomicUsize,
  pub queries: AtomicUsize,
  pub runs: AtomicUsize,
  pub overlaps: AtomicUsize,
  pub active: AtomicUsize,
  pub max_active: AtomicUsize,
  live: Mutex<HashSet<usize>>,
}

impl Counters {
  pub fn live(&self) -> usize {
    self.live.lock().len()
  }
}

pub struct FakeHandle {
  id: usize,
  queries: AtomicUsize,
  busy: AtomicBool,
}

/// 可编排失败点的运行时, 统计句柄的创建和释放
pub struct FakeRuntime {
  pub script: Script,
  pub counters: Arc<Counters>,
}

impl FakeRuntime {
  pub fn new(script: Script) -> (Self, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    (
      Self {
        script,
        counters: counters.clone(),
      },
      counters,
    )
  }

  fn new_handle(&self) -> FakeHandle {
    let id = self.counters.created.fetch_add(1, Ordering::SeqCst);
    self.counters.live.lock().insert(id);
    FakeHandle {
      id,
      queries: AtomicUsize::new(0),
      busy: AtomicBool::new(false),
    }
  }

  fn count_query(&self, handle: &FakeHandle) -> Result<(), RuntimeError> {
    self.counters.queries.fetch_add(1, Ordering::SeqCst);
    let n = handle.queries.fetch_add(1, Ordering::SeqCst) + 1;
    match self.script.fail_query {
      Some(QueryFailure { handle: h, at }) if h == handle.id && at == n => Err(RuntimeError::Status {
        op: "rknn_query",
        code: -5,
      }),
      _ => Ok(()),
    }
  }

  fn attr(index: u32, dims: Vec<u32>, format: TensorFormat) -> TensorAttr {
    TensorAttr {
      index,
      name: format!("tensor{index}"),
      dims,
      format,
      dtype: TensorType::UInt8,
      qnt_type: QuantType::AffineAsymmetric,
      zero_point: 0,
      scale: 1.0,
    }
  }
}

impl Runtime for FakeRuntime {
  type Handle = FakeHandle;

  fn load(&self, model: &[u8]) -> Result<FakeHandle, RuntimeError> {
    if self.script.fail_load || model.is_empty() {
      return Err(RuntimeError::Status {
        op: "rknn_init",
        code: -1,
      });
    }
    Ok(self.new_handle())
  }

  fn duplicate(&self, _parent: &FakeHandle) -> Result<FakeHandle, RuntimeError> {
    let n = self.counters.duplicate_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if self.script.fail_duplicate_at == Some(n) {
      return Err(RuntimeError::Status {
        op: "rknn_dup_context",
        code: -2,
      });
    }
    Ok(self.new_handle())
  }

  fn io_num(&self, handle: &FakeHandle) -> Result<IoNum, RuntimeError> {
    self.count_query(handle)?;
    Ok(IoNum {
      inputs: 1,
      outputs: 2,
    })
  }

  fn input_attr(&self, handle: &FakeHandle, index: u32) -> Result<TensorAttr, RuntimeError> {
    self.count_query(handle)?;
    Ok(Self::attr(
      index,
      vec![1, MODEL_SIZE, MODEL_SIZE, 3],
      TensorFormat::Nhwc,
    ))
  }

  fn output_attr(&self, handle: &FakeHandle, index: u32) -> Result<TensorAttr, RuntimeError> {
    self.count_query(handle)?;
    Ok(Self::attr(index, vec![1, 1], TensorFormat::Undefined))
  }

  fn run(
    &self,
    handle: &mut FakeHandle,
    input: &[u8],
    _format: TensorFormat,
  ) -> Result<RawOutputs, RuntimeError> {
    if handle.busy.swap(true, Ordering::SeqCst) {
      self.counters.overlaps.fetch_add(1, Ordering::SeqCst);
    }
    let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.counters.max_active.fetch_max(active, Ordering::SeqCst);
    self.counters.runs.fetch_add(1, Ordering::SeqCst);

    let tag = input.first().copied().unwrap_or(0);
    if let Some(latency) = self.script.latency {
      thread::sleep(latency(tag, handle.id));
    }

    self.counters.active.fetch_sub(1, Ordering::SeqCst);
    handle.busy.store(false, Ordering::SeqCst);

    if self.script.fail_run_tag == Some(tag) {
      return Err(RuntimeError::Status {
        op: "rknn_run",
        code: -3,
      });
    }
    Ok(RawOutputs::new(vec![vec![tag as f32].into_boxed_slice()]))
  }

  fn release(&self, handle: FakeHandle) {
    if self.counters.live.lock().remove(&handle.id) {
      self.counters.released.fetch_add(1, Ordering::SeqCst);
    } else {
      self.counters.double_released.fetch_add(1, Ordering::SeqCst);
    }
  }
}

/// 把输出里的标记值作为类别, 在模型坐标系中央给一个框
pub struct TagPost;

impl PostProcess for TagPost {
  fn postprocess(&self, output: &RawOutputs, _meta: &ModelMeta) -> DetectResult {
    let tag = output.get_f32(0).map(|t| t[0]).unwrap_or(-1.0);
    DetectResult::bounded(vec![DetectItem {
      class_id: tag as u32,
      score: 0.9,
      bbox: [16.0, 16.0, 48.0, 48.0],
    }])
  }
}

pub fn model_file() -> NamedTempFile {
  let mut file = NamedTempFile::new().unwrap();
  file.write_all(b"fake model weights").unwrap();
  file.flush().unwrap();
  file
}

/// 内容全部为 `tag` 的帧, 尺寸与模型输入一致
pub fn tagged_frame(tag: u8) -> Frame {
  Frame::filled(MODEL_SIZE, MODEL_SIZE, PixelFormat::Rgb888, tag).unwrap()
}

pub fn tag_of(result: &DetectResult) -> Option<u8> {
  result.items.first().map(|item| item.class_id as u8)
}

pub fn post() -> Arc<dyn PostProcess> {
  Arc::new(TagPost)
}
