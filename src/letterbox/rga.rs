// 该文件是 Shanan （山南西风） 项目的一部分。
// src/letterbox/rga.rs - RGA 硬件缩放
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

//! # RGA 缩放
//!
//! 通过 `librga` 的 `imresize` 在 2D 加速器上缩放, 源和目标区域以虚拟地址
//! 加行跨度的方式交给 RGA, 因此可以直接写入目标帧的内容区域。
//!
//! ## Cargo 特性
//!
//! ```toml
//! [dependencies]
//! shanan-pool = { version = "0.1", features = ["rga"] }
//! ```

use std::ffi::{c_int, c_void};

use tracing::debug;

use crate::{
  frame::{Frame, PixelFormat},
  letterbox::{Rect, Resize, ResizeError},
};

const RK_FORMAT_RGBA_8888: c_int = 0x0;
const RK_FORMAT_RGB_888: c_int = 0x2 << 8;

const INTER_LINEAR: c_int = 1;

#[repr(C)]
#[allow(dead_code)]
struct ImColorkeyRange {
  max: c_int,
  min: c_int,
}

#[repr(C)]
#[allow(dead_code)]
struct ImNn {
  scale_r: c_int,
  scale_g: c_int,
  scale_b: c_int,
  offset_r: c_int,
  offset_g: c_int,
  offset_b: c_int,
}

#[repr(C)]
#[allow(dead_code)]
struct RgaBuffer {
  vir_addr: *mut c_void,
  phy_addr: *mut c_void,
  fd: c_int,
  width: c_int,
  height: c_int,
  wstride: c_int,
  hstride: c_int,
  format: c_int,
  color_space_mode: c_int,
  global_alpha: c_int,
  rd_mode: c_int,
  color: c_int,
  colorkey_range: ImColorkeyRange,
  nn: ImNn,
  rop_code: c_int,
  handle: c_int,
}

#[link(name = "rga")]
unsafe extern "C" {
  fn wrapbuffer_virtualaddr_t(
    vir_addr: *mut c_void,
    width: c_int,
    height: c_int,
    wstride: c_int,
    hstride: c_int,
    format: c_int,
  ) -> RgaBuffer;
  fn imresize_t(
    src: RgaBuffer,
    dst: RgaBuffer,
    fx: f64,
    fy: f64,
    interpolation: c_int,
    sync: c_int,
  ) -> c_int;
}

fn rga_format(format: PixelFormat) -> Option<c_int> {
  match format {
    PixelFormat::Rgb888 => Some(RK_FORMAT_RGB_888),
    PixelFormat::Rgba8888 => Some(RK_FORMAT_RGBA_8888),
    _ => None,
  }
}

/// 帧内一个区域在 RGA 看来的样子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
  offset: usize,
  width: c_int,
  height: c_int,
  wstride: c_int,
  format: c_int,
}

impl Region {
  fn of(frame: &Frame, rect: Rect) -> Result<Self, ResizeError> {
    if !rect.fits_in(frame) {
      return Err(ResizeError::InvalidRect);
    }
    let bpp = frame
      .format()
      .bytes_per_pixel()
      .ok_or(ResizeError::InvalidRect)?;
    // RGA 以像素为单位描述行跨度
    if frame.stride() % bpp != 0 {
      return Err(ResizeError::InvalidRect);
    }
    let int = |v: usize| c_int::try_from(v).map_err(|_| ResizeError::InvalidRect);

    Ok(Self {
      offset: rect.top as usize * frame.stride() + rect.left as usize * bpp,
      width: int(rect.width() as usize)?,
      height: int(rect.height() as usize)?,
      wstride: int(frame.stride() / bpp)?,
      format: rga_format(frame.format()).ok_or(ResizeError::InvalidRect)?,
    })
  }

  /// `base` 必须指向区域所在帧的数据起始位置
  unsafe fn wrap(&self, base: *mut u8) -> RgaBuffer {
    unsafe {
      wrapbuffer_virtualaddr_t(
        base.add(self.offset) as *mut c_void,
        self.width,
        self.height,
        self.wstride,
        self.height,
        self.format,
      )
    }
  }
}

/// RGA 缩放, 支持 RGB888 与 RGBA8888 之间任意组合
#[derive(Debug, Default, Clone, Copy)]
pub struct RgaResize;

impl Resize for RgaResize {
  fn name(&self) -> &'static str {
    "rga"
  }

  fn resize(
    &self,
    src: &Frame,
    src_rect: Rect,
    dst: &mut Frame,
    dst_rect: Rect,
  ) -> Result<(), ResizeError> {
    if rga_format(src.format()).is_none() || rga_format(dst.format()).is_none() {
      return Err(ResizeError::UnsupportedFormat {
        src: src.format(),
        dst: dst.format(),
      });
    }
    let src_region = Region::of(src, src_rect)?;
    let dst_region = Region::of(dst, dst_rect)?;

    // RGA 只读取源缓冲区
    let code = unsafe {
      let src_buf = src_region.wrap(src.data().as_ptr() as *mut u8);
      let dst_buf = dst_region.wrap(dst.data_mut().as_mut_ptr());
      imresize_t(src_buf, dst_buf, 0.0, 0.0, INTER_LINEAR, 1)
    };
    // IM_STATUS_SUCCESS 与 IM_STATUS_NOERROR 均为正数
    if code <= 0 {
      return Err(ResizeError::Status(code));
    }

    debug!(
      "RGA 缩放 {}x{} -> {}x{}",
      src_region.width, src_region.height, dst_region.width, dst_region.height
    );
    Ok(())
  }
}
