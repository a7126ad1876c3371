// 该文件是 Shanan （山南西风） 项目的一部分。
// src/runtime.rs - 模型运行时接口
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

//! 推理运行时抽象
//!
//! 运行时以句柄为单位工作: 一个句柄由 [`Runtime::load`] 从模型数据创建,
//! 其余句柄由 [`Runtime::duplicate`] 复制而来, 与源句柄共享权重但拥有独立的
//! 执行状态。张量属性查询的作用域是句柄, 因此每个句柄都要单独查询。
//!
//! 同一个句柄在任意时刻只能执行一次推理。

use thiserror::Error;

#[cfg(feature = "rknn")]
pub mod rknn;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
  #[error("{op} 失败, 返回码 {code}")]
  Status { op: &'static str, code: i32 },
  #[error("{op} 失败: {message}")]
  Backend { op: &'static str, message: String },
  #[error("输出索引越界: {index}, 共 {count} 个输出")]
  OutputIndex { index: usize, count: usize },
  #[error("模型数据过大: {0} 字节")]
  ModelTooLarge(usize),
  #[error("{0}")]
  Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorFormat {
  Nchw,
  Nhwc,
  Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorType {
  Float32,
  Float16,
  Int8,
  UInt8,
  Int16,
  Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantType {
  None,
  Dfp,
  AffineAsymmetric,
}

/// 模型输入输出数量
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoNum {
  pub inputs: u32,
  pub outputs: u32,
}

/// 单个张量的属性
#[derive(Debug, Clone, PartialEq)]
pub struct TensorAttr {
  pub index: u32,
  pub name: String,
  pub dims: Vec<u32>,
  pub format: TensorFormat,
  pub dtype: TensorType,
  pub qnt_type: QuantType,
  pub zero_point: i32,
  pub scale: f32,
}

/// 一次推理的全部输出, 已转换为 f32
#[derive(Debug, Clone, Default)]
pub struct RawOutputs {
  tensors: Vec<Box<[f32]>>,
}

impl RawOutputs {
  pub fn new(tensors: Vec<Box<[f32]>>) -> Self {
    Self { tensors }
  }

  pub fn len(&self) -> usize {
    self.tensors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tensors.is_empty()
  }

  pub fn get_f32(&self, index: usize) -> Result<&[f32], RuntimeError> {
    self
      .tensors
      .get(index)
      .map(|t| &t[..])
      .ok_or(RuntimeError::OutputIndex {
        index,
        count: self.tensors.len(),
      })
  }
}

/// 推理运行时
///
/// 所有操作都可能失败; 调用方不假设任何一步必然成功。
pub trait Runtime: Send + Sync + 'static {
  type Handle: Send + 'static;

  /// 从模型数据创建根句柄
  fn load(&self, model: &[u8]) -> Result<Self::Handle, RuntimeError>;

  /// 复制句柄: 共享已加载的权重, 不重新加载模型
  fn duplicate(&self, parent: &Self::Handle) -> Result<Self::Handle, RuntimeError>;

  fn io_num(&self, handle: &Self::Handle) -> Result<IoNum, RuntimeError>;

  fn input_attr(&self, handle: &Self::Handle, index: u32) -> Result<TensorAttr, RuntimeError>;

  fn output_attr(&self, handle: &Self::Handle, index: u32) -> Result<TensorAttr, RuntimeError>;

  /// 以单个 u8 输入执行一次同步推理
  fn run(
    &self,
    handle: &mut Self::Handle,
    input: &[u8],
    format: TensorFormat,
  ) -> Result<RawOutputs, RuntimeError>;

  /// 释放句柄, 每个句柄只会被调用一次
  fn release(&self, handle: Self::Handle);
}
