// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/context.rs - 模型上下文与上下文复制
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{path::Path, sync::Arc};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  frame::{Frame, FrameError, PixelFormat},
  letterbox::{LetterboxError, Letterboxer},
  model::{DetectResult, PostProcess},
  output::draw::Draw,
  runtime::{IoNum, QuantType, Runtime, RuntimeError, TensorAttr, TensorFormat, TensorType},
};

#[derive(Error, Debug)]
pub enum ContextError {
  #[error("模型加载错误: {0}")]
  ModelLoad(#[from] std::io::Error),
  #[error("{what}: {source}")]
  Runtime {
    what: String,
    #[source]
    source: RuntimeError,
  },
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("输入尺寸不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  InputMismatch {
    expected: (u32, u32, PixelFormat),
    actual: (u32, u32, PixelFormat),
  },
  #[error("预处理错误: {0}")]
  Letterbox(#[from] LetterboxError),
  #[error("帧错误: {0}")]
  Frame(#[from] FrameError),
  #[error("上下文已释放")]
  Released,
}

impl ContextError {
  pub fn runtime(what: &str, source: RuntimeError) -> Self {
    ContextError::Runtime {
      what: what.to_string(),
      source,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRole {
  /// 从磁盘加载权重
  Root,
  /// 复制自根上下文, 共享权重
  Duplicate,
}

/// 由张量属性推导出的模型元数据, 每个句柄独立查询
#[derive(Debug, Clone)]
pub struct ModelMeta {
  pub io_num: IoNum,
  pub input_attrs: Vec<TensorAttr>,
  pub output_attrs: Vec<TensorAttr>,
  pub channel: u32,
  pub height: u32,
  pub width: u32,
  pub is_quant: bool,
}

impl ModelMeta {
  pub fn query<R: Runtime>(runtime: &R, handle: &R::Handle) -> Result<Self, ContextError> {
    let io_num = runtime
      .io_num(handle)
      .map_err(|e| ContextError::runtime("无法获取输入输出数量", e))?;
    debug!("模型输入数量: {}, 输出数量: {}", io_num.inputs, io_num.outputs);

    if io_num.inputs == 0 || io_num.outputs == 0 {
      return Err(ContextError::ModelInvalid(format!(
        "输入数量 {}, 输出数量 {}",
        io_num.inputs, io_num.outputs
      )));
    }

    let input_attrs = (0..io_num.inputs)
      .map(|i| {
        runtime
          .input_attr(handle, i)
          .map_err(|e| ContextError::runtime(&format!("无法查询第 {} 个输入属性", i), e))
      })
      .collect::<Result<Vec<_>, _>>()?;

    let output_attrs = (0..io_num.outputs)
      .map(|i| {
        runtime
          .output_attr(handle, i)
          .map_err(|e| ContextError::runtime(&format!("无法查询第 {} 个输出属性", i), e))
      })
      .collect::<Result<Vec<_>, _>>()?;

    let input = &input_attrs[0];
    if input.dims.len() < 4 {
      return Err(ContextError::ModelInvalid(format!(
        "输入张量维度 {:?} 不是四维",
        input.dims
      )));
    }

    let dims = &input.dims;
    let (channel, height, width) = match input.format {
      TensorFormat::Nchw => (dims[1], dims[2], dims[3]),
      _ => (dims[3], dims[1], dims[2]),
    };

    if PixelFormat::from_channels(channel).is_none() || height == 0 || width == 0 {
      return Err(ContextError::ModelInvalid(format!(
        "不支持的输入形状: {}x{}x{}",
        channel, height, width
      )));
    }

    let output = &output_attrs[0];
    let is_quant =
      output.qnt_type == QuantType::AffineAsymmetric && output.dtype == TensorType::UInt8;

    debug!(
      "模型输入: {}x{}x{} ({:?}), 量化: {}",
      width, height, channel, input.format, is_quant
    );

    Ok(Self {
      io_num,
      input_attrs,
      output_attrs,
      channel,
      height,
      width,
      is_quant,
    })
  }

  /// 模型输入对应的帧格式
  pub fn input_format(&self) -> PixelFormat {
    PixelFormat::from_channels(self.channel).unwrap_or(PixelFormat::Rgb888)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
  /// 推理成功, 检测框已画在帧上
  Detected,
  /// 预处理失败, 原帧直接透传
  PreprocessFailed,
  /// 推理失败, 原帧直接透传
  InferenceFailed,
  /// 没有被任何工作线程处理
  Dropped,
}

/// 一帧的处理结果
#[derive(Debug, Clone)]
pub struct FrameResult {
  pub frame: Frame,
  /// 原图像素坐标下的检测框
  pub detections: DetectResult,
  pub status: FrameStatus,
  pub worker: Option<usize>,
}

impl FrameResult {
  pub fn passthrough(frame: Frame, status: FrameStatus, worker: Option<usize>) -> Self {
    Self {
      frame,
      detections: DetectResult::default(),
      status,
      worker,
    }
  }

  pub fn is_detected(&self) -> bool {
    self.status == FrameStatus::Detected
  }
}

/// 一个可以独立推理的模型上下文
///
/// 根上下文从磁盘加载权重, 其余上下文通过 [`ModelContext::duplicate`]
/// 共享根上下文的权重。一个上下文同一时刻只服务一次推理, 由 `&mut self` 保证。
pub struct ModelContext<R: Runtime> {
  index: usize,
  role: ContextRole,
  runtime: Arc<R>,
  handle: Option<R::Handle>,
  post: Option<Arc<dyn PostProcess>>,
  meta: ModelMeta,
  input: Frame,
  draw: Draw,
}

impl<R: Runtime> ModelContext<R> {
  /// 创建根上下文: 从 `model_path` 加载权重
  pub fn load(
    runtime: Arc<R>,
    model_path: &Path,
    post: Arc<dyn PostProcess>,
  ) -> Result<Self, ContextError> {
    info!("加载模型文件: {}", model_path.display());
    let model_data = std::fs::read(model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    let handle = runtime
      .load(&model_data)
      .map_err(|e| ContextError::runtime("无法创建推理上下文", e))?;
    let context = Self::from_handle(0, ContextRole::Root, runtime, handle, post)?;
    info!("模型加载完成");
    Ok(context)
  }

  /// 复制出一个共享权重、执行状态独立的上下文
  pub fn duplicate(&self, index: usize) -> Result<Self, ContextError> {
    let parent = self.handle.as_ref().ok_or(ContextError::Released)?;
    let post = self.post.clone().ok_or(ContextError::Released)?;

    let handle = self.runtime.duplicate(parent).map_err(|e| {
      error!("上下文 {} 复制失败: {}", index, e);
      ContextError::runtime("无法复制推理上下文", e)
    })?;

    let mut context = Self::from_handle(
      index,
      ContextRole::Duplicate,
      self.runtime.clone(),
      handle,
      post,
    )?;
    context.draw = self.draw.clone();
    Ok(context)
  }

  /// 查询句柄属性并组装上下文, 失败时释放句柄
  fn from_handle(
    index: usize,
    role: ContextRole,
    runtime: Arc<R>,
    handle: R::Handle,
    post: Arc<dyn PostProcess>,
  ) -> Result<Self, ContextError> {
    let prepared = ModelMeta::query(&*runtime, &handle).and_then(|meta| {
      let input = Frame::filled(meta.width, meta.height, meta.input_format(), 0)?;
      Ok((meta, input))
    });

    let (meta, input) = match prepared {
      Ok(prepared) => prepared,
      Err(e) => {
        error!("上下文 {} ({:?}) 初始化失败: {}", index, role, e);
        runtime.release(handle);
        return Err(e);
      }
    };

    debug!("上下文 {} ({:?}) 就绪", index, role);
    Ok(Self {
      index,
      role,
      runtime,
      handle: Some(handle),
      post: Some(post),
      meta,
      input,
      draw: Draw::default(),
    })
  }

  pub fn index(&self) -> usize {
    self.index
  }

  pub fn role(&self) -> ContextRole {
    self.role
  }

  pub fn meta(&self) -> &ModelMeta {
    &self.meta
  }

  /// 画框方式, 之后复制出的上下文沿用同一设置
  pub fn set_draw(&mut self, draw: Draw) {
    self.draw = draw;
  }

  pub fn is_released(&self) -> bool {
    self.handle.is_none()
  }

  /// 对一帧已经预处理好的输入做推理, 结果位于模型输入坐标系
  pub fn infer(&mut self, input: &Frame) -> Result<DetectResult, ContextError> {
    run_inference(
      &*self.runtime,
      self.handle.as_mut(),
      self.post.as_deref(),
      &self.meta,
      input,
    )
  }

  /// 完整处理一帧: 预处理, 推理, 坐标还原, 画框
  ///
  /// 任何一步失败都返回未经标注的原帧, 上下文仍可继续使用。
  pub fn process(&mut self, mut frame: Frame, letterboxer: &Letterboxer) -> FrameResult {
    let (detections, status) = self.annotate(&mut frame, letterboxer);
    FrameResult {
      frame,
      detections,
      status,
      worker: Some(self.index),
    }
  }

  /// 同 [`process`](Self::process), 但帧留在调用方手里
  ///
  /// 画框是最后一步, 之前的任何失败都不会改动 `frame`。
  pub fn annotate(&mut self, frame: &mut Frame, letterboxer: &Letterboxer) -> (DetectResult, FrameStatus) {
    let transform = match letterboxer.letterbox(frame, &mut self.input) {
      Ok(transform) => transform,
      Err(e) => {
        warn!("上下文 {} 预处理失败: {}", self.index, e);
        return (DetectResult::default(), FrameStatus::PreprocessFailed);
      }
    };

    let result = run_inference(
      &*self.runtime,
      self.handle.as_mut(),
      self.post.as_deref(),
      &self.meta,
      &self.input,
    );

    let detections = match result {
      Ok(detections) => detections,
      Err(e) => {
        warn!("上下文 {} 推理失败: {}", self.index, e);
        return (DetectResult::default(), FrameStatus::InferenceFailed);
      }
    };

    let (width, height) = (frame.width(), frame.height());
    let detections = detections.map_boxes(|bbox| transform.unproject_box(bbox, width, height));
    debug!("上下文 {} 检测到 {} 个物体", self.index, detections.len());

    if !self.draw.draw_detections(frame, &detections) {
      debug!("帧格式 {:?} 不支持画框", frame.format());
    }

    (detections, FrameStatus::Detected)
  }

  /// 释放后处理资源和运行时句柄, 重复调用无副作用
  ///
  /// 返回本次调用是否真正释放了句柄。
  pub fn teardown(&mut self) -> bool {
    self.post.take();
    match self.handle.take() {
      Some(handle) => {
        self.runtime.release(handle);
        debug!("上下文 {} ({:?}) 已释放", self.index, self.role);
        true
      }
      None => false,
    }
  }
}

impl<R: Runtime> Drop for ModelContext<R> {
  fn drop(&mut self) {
    self.teardown();
  }
}

fn run_inference<R: Runtime>(
  runtime: &R,
  handle: Option<&mut R::Handle>,
  post: Option<&dyn PostProcess>,
  meta: &ModelMeta,
  input: &Frame,
) -> Result<DetectResult, ContextError> {
  let (handle, post) = match (handle, post) {
    (Some(handle), Some(post)) => (handle, post),
    _ => return Err(ContextError::Released),
  };

  let expected = (meta.width, meta.height, meta.input_format());
  let actual = (input.width(), input.height(), input.format());
  if expected != actual || !input.is_packed() {
    return Err(ContextError::InputMismatch { expected, actual });
  }

  let output = runtime
    .run(handle, input.data(), TensorFormat::Nhwc)
    .map_err(|e| ContextError::runtime("推理执行失败", e))?;

  let result = post.postprocess(&output, meta);
  Ok(DetectResult::bounded(result.items.into_vec()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::runtime::RawOutputs;

  /// 只回答属性查询的运行时
  struct AttrOnly {
    input_format: TensorFormat,
    dims: Vec<u32>,
    output: (QuantType, TensorType),
  }

  impl Runtime for AttrOnly {
    type Handle = ();

    fn load(&self, _: &[u8]) -> Result<(), RuntimeError> {
      Ok(())
    }

    fn duplicate(&self, _: &()) -> Result<(), RuntimeError> {
      Ok(())
    }

    fn io_num(&self, _: &()) -> Result<IoNum, RuntimeError> {
      Ok(IoNum {
        inputs: 1,
        outputs: 1,
      })
    }

    fn input_attr(&self, _: &(), index: u32) -> Result<TensorAttr, RuntimeError> {
      Ok(attr(index, self.dims.clone(), self.input_format, QuantType::None, TensorType::UInt8))
    }

    fn output_attr(&self, _: &(), index: u32) -> Result<TensorAttr, RuntimeError> {
      Ok(attr(index, vec![1, 84, 8400], TensorFormat::Undefined, self.output.0, self.output.1))
    }

    fn run(&self, _: &mut (), _: &[u8], _: TensorFormat) -> Result<RawOutputs, RuntimeError> {
      Ok(RawOutputs::default())
    }

    fn release(&self, _: ()) {}
  }

  fn attr(
    index: u32,
    dims: Vec<u32>,
    format: TensorFormat,
    qnt_type: QuantType,
    dtype: TensorType,
  ) -> TensorAttr {
    TensorAttr {
      index,
      name: format!("t{index}"),
      dims,
      format,
      dtype,
      qnt_type,
      zero_point: 0,
      scale: 1.0,
    }
  }

  #[test]
  fn reads_channel_last_layout() {
    let rt = AttrOnly {
      input_format: TensorFormat::Nhwc,
      dims: vec![1, 480, 640, 3],
      output: (QuantType::AffineAsymmetric, TensorType::UInt8),
    };
    let meta = ModelMeta::query(&rt, &()).unwrap();
    assert_eq!((meta.channel, meta.height, meta.width), (3, 480, 640));
    assert!(meta.is_quant);
    assert_eq!(meta.input_format(), PixelFormat::Rgb888);
  }

  #[test]
  fn reads_channel_first_layout() {
    let rt = AttrOnly {
      input_format: TensorFormat::Nchw,
      dims: vec![1, 3, 384, 640],
      output: (QuantType::None, TensorType::Float32),
    };
    let meta = ModelMeta::query(&rt, &()).unwrap();
    assert_eq!((meta.channel, meta.height, meta.width), (3, 384, 640));
    assert!(!meta.is_quant);
  }

  #[test]
  fn int8_affine_output_is_not_the_quantized_u8_path() {
    let rt = AttrOnly {
      input_format: TensorFormat::Nhwc,
      dims: vec![1, 640, 640, 3],
      output: (QuantType::AffineAsymmetric, TensorType::Int8),
    };
    assert!(!ModelMeta::query(&rt, &()).unwrap().is_quant);
  }

  #[test]
  fn rejects_unsupported_input_shapes() {
    let rt = AttrOnly {
      input_format: TensorFormat::Nhwc,
      dims: vec![1, 640, 640],
      output: (QuantType::None, TensorType::Float32),
    };
    assert!(matches!(
      ModelMeta::query(&rt, &()),
      Err(ContextError::ModelInvalid(_))
    ));

    let rt = AttrOnly {
      input_format: TensorFormat::Nhwc,
      dims: vec![1, 640, 640, 2],
      output: (QuantType::None, TensorType::Float32),
    };
    assert!(matches!(
      ModelMeta::query(&rt, &()),
      Err(ContextError::ModelInvalid(_))
    ));
  }
}
