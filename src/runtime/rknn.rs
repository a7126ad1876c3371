// 该文件是 Shanan （山南西风） 项目的一部分。
// src/runtime/rknn.rs - RKNN 运行时
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

//! # RKNN 运行时
//!
//! 基于 [`rknpu::Context`], 需要在 RK3588 等带 NPU 的板卡上运行。
//! `rknpu` 没有提供上下文复制和张量属性查询, 这两项直接调用 `librknnrt`。
//!
//! ## Cargo 特性
//!
//! ```toml
//! [dependencies]
//! shanan-pool = { version = "0.1", features = ["rknn"] }
//! ```

use std::ffi::{CStr, c_char, c_int, c_void};

use rknpu::{Context, InitFlags};
use tracing::{debug, error, info};

use crate::runtime::{
  IoNum, QuantType, RawOutputs, Runtime, RuntimeError, TensorAttr, TensorFormat, TensorType,
};

#[cfg(target_pointer_width = "64")]
type RawContext = u64;
#[cfg(not(target_pointer_width = "64"))]
type RawContext = u32;

const RKNN_MAX_DIMS: usize = 16;
const RKNN_MAX_NAME_LEN: usize = 256;

const RKNN_QUERY_INPUT_ATTR: c_int = 1;
const RKNN_QUERY_OUTPUT_ATTR: c_int = 2;

const RKNN_TENSOR_NCHW: c_int = 0;
const RKNN_TENSOR_NHWC: c_int = 1;

const RKNN_TENSOR_FLOAT32: c_int = 0;
const RKNN_TENSOR_FLOAT16: c_int = 1;
const RKNN_TENSOR_INT8: c_int = 2;
const RKNN_TENSOR_UINT8: c_int = 3;
const RKNN_TENSOR_INT16: c_int = 4;

const RKNN_TENSOR_QNT_DFP: c_int = 1;
const RKNN_TENSOR_QNT_AFFINE_ASYMMETRIC: c_int = 2;

#[repr(C)]
#[allow(dead_code)]
struct RknnTensorAttr {
  index: u32,
  n_dims: u32,
  dims: [u32; RKNN_MAX_DIMS],
  name: [c_char; RKNN_MAX_NAME_LEN],
  n_elems: u32,
  size: u32,
  fmt: c_int,
  type_: c_int,
  qnt_type: c_int,
  fl: i8,
  zp: i32,
  scale: f32,
  w_stride: u32,
  size_with_stride: u32,
  pass_through: u8,
  h_stride: u32,
}

impl RknnTensorAttr {
  fn with_index(index: u32) -> Self {
    Self {
      index,
      n_dims: 0,
      dims: [0; RKNN_MAX_DIMS],
      name: [0; RKNN_MAX_NAME_LEN],
      n_elems: 0,
      size: 0,
      fmt: 0,
      type_: 0,
      qnt_type: 0,
      fl: 0,
      zp: 0,
      scale: 0.0,
      w_stride: 0,
      size_with_stride: 0,
      pass_through: 0,
      h_stride: 0,
    }
  }

  fn to_attr(&self) -> TensorAttr {
    let n_dims = (self.n_dims as usize).min(RKNN_MAX_DIMS);
    // 末尾强制置零, 名字总以 NUL 结尾
    let mut name = self.name;
    name[RKNN_MAX_NAME_LEN - 1] = 0;
    let name = unsafe { CStr::from_ptr(name.as_ptr()) }
      .to_string_lossy()
      .into_owned();

    TensorAttr {
      index: self.index,
      name,
      dims: self.dims[..n_dims].to_vec(),
      format: match self.fmt {
        RKNN_TENSOR_NCHW => TensorFormat::Nchw,
        RKNN_TENSOR_NHWC => TensorFormat::Nhwc,
        _ => TensorFormat::Undefined,
      },
      dtype: match self.type_ {
        RKNN_TENSOR_FLOAT32 => TensorType::Float32,
        RKNN_TENSOR_FLOAT16 => TensorType::Float16,
        RKNN_TENSOR_INT8 => TensorType::Int8,
        RKNN_TENSOR_UINT8 => TensorType::UInt8,
        RKNN_TENSOR_INT16 => TensorType::Int16,
        other => TensorType::Other(other as u32),
      },
      qnt_type: match self.qnt_type {
        RKNN_TENSOR_QNT_DFP => QuantType::Dfp,
        RKNN_TENSOR_QNT_AFFINE_ASYMMETRIC => QuantType::AffineAsymmetric,
        _ => QuantType::None,
      },
      zero_point: self.zp,
      scale: self.scale,
    }
  }
}

#[link(name = "rknnrt")]
unsafe extern "C" {
  fn rknn_dup_context(context_in: *mut RawContext, context_out: *mut RawContext) -> c_int;
  fn rknn_query(context: RawContext, cmd: c_int, info: *mut c_void, size: u32) -> c_int;
}

fn check(op: &'static str, code: c_int) -> Result<(), RuntimeError> {
  if code < 0 {
    error!("{} 错误, 返回码 {}", op, code);
    Err(RuntimeError::Status { op, code })
  } else {
    Ok(())
  }
}

fn backend(op: &'static str) -> impl FnOnce(rknpu::Error) -> RuntimeError {
  move |e| {
    error!("{} 错误: {}", op, e);
    RuntimeError::Backend {
      op,
      message: e.to_string(),
    }
  }
}

/// RKNN 句柄, 释放时由 [`Context`] 销毁底层上下文
pub struct RknnHandle {
  context: Context,
  outputs: u32,
}

// 同一时刻只有持有者线程使用该上下文
unsafe impl Send for RknnHandle {}

impl RknnHandle {
  fn new(context: Context) -> Result<Self, RuntimeError> {
    let outputs = context.num_outputs().map_err(backend("num_outputs"))?;
    Ok(Self { context, outputs })
  }
}

/// 基于 rknpu 的运行时
#[derive(Debug, Default, Clone, Copy)]
pub struct RknnRuntime;

impl RknnRuntime {
  fn query_attr(
    &self,
    handle: &RknnHandle,
    cmd: c_int,
    index: u32,
  ) -> Result<TensorAttr, RuntimeError> {
    let mut attr = RknnTensorAttr::with_index(index);
    let code = unsafe {
      rknn_query(
        handle.context.as_raw(),
        cmd,
        &mut attr as *mut RknnTensorAttr as *mut c_void,
        size_of::<RknnTensorAttr>() as u32,
      )
    };
    check("rknn_query", code)?;
    Ok(attr.to_attr())
  }
}

impl Runtime for RknnRuntime {
  type Handle = RknnHandle;

  fn load(&self, model: &[u8]) -> Result<Self::Handle, RuntimeError> {
    info!("创建 RKNN 推理上下文");
    let context = Context::new(model, InitFlags::default()).map_err(backend("rknn_init"))?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => return Err(backend("rknn_query_sdk_version")(e)),
    }

    RknnHandle::new(context)
  }

  fn duplicate(&self, parent: &Self::Handle) -> Result<Self::Handle, RuntimeError> {
    let mut context_in = parent.context.as_raw();
    let mut context_out: RawContext = 0;
    let code = unsafe { rknn_dup_context(&mut context_in, &mut context_out) };
    check("rknn_dup_context", code)?;
    debug!(
      "rknn_dup_context 完成, {:#x} -> {:#x}",
      context_in, context_out
    );
    // 复制出的上下文归新句柄所有, 与源上下文各自销毁
    let context = unsafe { Context::from_raw(context_out) };
    RknnHandle::new(context)
  }

  fn io_num(&self, handle: &Self::Handle) -> Result<IoNum, RuntimeError> {
    Ok(IoNum {
      inputs: handle
        .context
        .num_inputs()
        .map_err(backend("num_inputs"))?,
      outputs: handle
        .context
        .num_outputs()
        .map_err(backend("num_outputs"))?,
    })
  }

  fn input_attr(&self, handle: &Self::Handle, index: u32) -> Result<TensorAttr, RuntimeError> {
    self.query_attr(handle, RKNN_QUERY_INPUT_ATTR, index)
  }

  fn output_attr(&self, handle: &Self::Handle, index: u32) -> Result<TensorAttr, RuntimeError> {
    self.query_attr(handle, RKNN_QUERY_OUTPUT_ATTR, index)
  }

  fn run(
    &self,
    handle: &mut Self::Handle,
    input: &[u8],
    format: TensorFormat,
  ) -> Result<RawOutputs, RuntimeError> {
    let format = match format {
      TensorFormat::Nchw => rknpu::TensorFormat::NCHW,
      _ => rknpu::TensorFormat::NHWC,
    };
    handle
      .context
      .set_input(0, input, format, rknpu::TensorType::UInt8)
      .map_err(backend("rknn_inputs_set"))?;
    handle.context.run().map_err(backend("rknn_run"))?;

    let output = handle
      .context
      .get_outputs()
      .map_err(backend("rknn_outputs_get"))?;
    let tensors = (0..handle.outputs as usize)
      .map(|index| {
        output
          .get_f32(index)
          .map(Box::<[f32]>::from)
          .map_err(backend("rknn_outputs_get"))
      })
      .collect::<Result<Vec<_>, _>>()?;

    Ok(RawOutputs::new(tensors))
  }

  fn release(&self, handle: Self::Handle) {
    debug!("销毁 RKNN 上下文 {:#x}", handle.context.as_raw());
    drop(handle);
  }
}
