// 该文件是 Shanan （山南西风） 项目的一部分。
// src/letterbox/nearest.rs - 软件最近邻缩放
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

use crate::{
  frame::{Frame, PixelFormat},
  letterbox::{Rect, Resize, ResizeError},
};

const RGB_CHANNELS: usize = 3;

/// CPU 最近邻缩放, 只支持 RGB888 -> RGB888
#[derive(Debug, Default, Clone, Copy)]
pub struct NearestRgb888;

impl Resize for NearestRgb888 {
  fn name(&self) -> &'static str {
    "nearest-rgb888"
  }

  fn resize(
    &self,
    src: &Frame,
    src_rect: Rect,
    dst: &mut Frame,
    dst_rect: Rect,
  ) -> Result<(), ResizeError> {
    if src.format() != PixelFormat::Rgb888 || dst.format() != PixelFormat::Rgb888 {
      return Err(ResizeError::UnsupportedFormat {
        src: src.format(),
        dst: dst.format(),
      });
    }

    if !src_rect.fits_in(src) || !dst_rect.fits_in(dst) {
      return Err(ResizeError::InvalidRect);
    }

    let (src_w, src_h) = (src_rect.width(), src_rect.height());
    let (dst_w, dst_h) = (dst_rect.width(), dst_rect.height());
    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    let src_stride = src.stride();
    let dst_stride = dst.stride();
    let src_data = src.data();
    let dst_data = dst.data_mut();

    for y in 0..dst_h {
      let sy = src_rect.top + ((y as f32 * y_ratio) as u32).min(src_h - 1);
      let src_row = &src_data[sy as usize * src_stride..];
      let dst_row = &mut dst_data[(dst_rect.top + y) as usize * dst_stride..];

      for x in 0..dst_w {
        let sx = src_rect.left + ((x as f32 * x_ratio) as u32).min(src_w - 1);
        let si = sx as usize * RGB_CHANNELS;
        let di = (dst_rect.left + x) as usize * RGB_CHANNELS;
        dst_row[di..di + RGB_CHANNELS].copy_from_slice(&src_row[si..si + RGB_CHANNELS]);
      }
    }

    Ok(())
  }
}
