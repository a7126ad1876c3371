// 该文件是 Shanan （山南西风） 项目的一部分。
// src/letterbox.rs - 等比缩放加边预处理
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

//! # Letterbox 预处理
//!
//! 将任意尺寸的帧等比缩放到模型输入尺寸, 多余部分用常量填充。
//!
//! 缩放由一组按顺序尝试的 [`Resize`] 策略完成: 先尝试硬件加速 (如 RGA),
//! 失败后退回到软件最近邻缩放 [`NearestRgb888`]。第一个成功的策略生效,
//! 全部失败时整个预处理失败。

use thiserror::Error;
use tracing::{debug, warn};

use crate::frame::{Frame, PixelFormat};

mod nearest;
pub use self::nearest::NearestRgb888;

#[cfg(feature = "rga")]
mod rga;
#[cfg(feature = "rga")]
pub use self::rga::RgaResize;

/// 像素区域, `right` 与 `bottom` 不包含在区域内
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
  pub left: u32,
  pub top: u32,
  pub right: u32,
  pub bottom: u32,
}

impl Rect {
  pub fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
    Self {
      left,
      top,
      right: left + width,
      bottom: top + height,
    }
  }

  pub fn of_frame(frame: &Frame) -> Self {
    Self::new(0, 0, frame.width(), frame.height())
  }

  pub fn width(&self) -> u32 {
    self.right.saturating_sub(self.left)
  }

  pub fn height(&self) -> u32 {
    self.bottom.saturating_sub(self.top)
  }

  pub fn is_empty(&self) -> bool {
    self.width() == 0 || self.height() == 0
  }

  pub fn fits_in(&self, frame: &Frame) -> bool {
    !self.is_empty() && self.right <= frame.width() && self.bottom <= frame.height()
  }
}

/// 单帧的缩放参数, 用于把模型坐标映射回原图
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxTransform {
  pub scale: f32,
  pub x_pad: u32,
  pub y_pad: u32,
  pub scaled_width: u32,
  pub scaled_height: u32,
}

impl LetterboxTransform {
  /// 根据源尺寸与目标尺寸计算缩放比例和居中边距
  pub fn compute(src_width: u32, src_height: u32, dst_width: u32, dst_height: u32) -> Self {
    let scale_w = dst_width as f32 / src_width as f32;
    let scale_h = dst_height as f32 / src_height as f32;
    let scale = scale_w.min(scale_h);

    let scaled_width = ((src_width as f32 * scale) as u32).min(dst_width);
    let scaled_height = ((src_height as f32 * scale) as u32).min(dst_height);

    Self {
      scale,
      x_pad: (dst_width - scaled_width) / 2,
      y_pad: (dst_height - scaled_height) / 2,
      scaled_width,
      scaled_height,
    }
  }

  /// 缩放后图像在目标帧中的区域
  pub fn content_rect(&self) -> Rect {
    Rect::new(self.x_pad, self.y_pad, self.scaled_width, self.scaled_height)
  }

  pub fn project_point(&self, x: f32, y: f32) -> (f32, f32) {
    (
      x * self.scale + self.x_pad as f32,
      y * self.scale + self.y_pad as f32,
    )
  }

  pub fn unproject_point(&self, x: f32, y: f32) -> (f32, f32) {
    (
      (x - self.x_pad as f32) / self.scale,
      (y - self.y_pad as f32) / self.scale,
    )
  }

  /// 将模型输入坐标系下的 `[x_min, y_min, x_max, y_max]` 映射回原图, 并裁剪到原图范围内
  pub fn unproject_box(&self, bbox: [f32; 4], src_width: u32, src_height: u32) -> [f32; 4] {
    let (x_min, y_min) = self.unproject_point(bbox[0], bbox[1]);
    let (x_max, y_max) = self.unproject_point(bbox[2], bbox[3]);
    let (w, h) = (src_width as f32, src_height as f32);
    [
      x_min.clamp(0.0, w),
      y_min.clamp(0.0, h),
      x_max.clamp(0.0, w),
      y_max.clamp(0.0, h),
    ]
  }
}

#[derive(Error, Debug)]
pub enum ResizeError {
  #[error("不支持的格式组合: {src:?} -> {dst:?}")]
  UnsupportedFormat { src: PixelFormat, dst: PixelFormat },
  #[error("缩放加速器不可用: {0}")]
  Unavailable(String),
  #[error("缩放返回错误状态: {0}")]
  Status(i32),
  #[error("缩放区域越界")]
  InvalidRect,
}

/// 一种缩放实现
///
/// 将 `src` 中的 `src_rect` 区域缩放写入 `dst` 的 `dst_rect` 区域,
/// 不得改动 `dst_rect` 以外的像素。
pub trait Resize: Send + Sync {
  fn name(&self) -> &'static str;

  fn resize(
    &self,
    src: &Frame,
    src_rect: Rect,
    dst: &mut Frame,
    dst_rect: Rect,
  ) -> Result<(), ResizeError>;
}

#[derive(Error, Debug)]
pub enum LetterboxError {
  #[error("缓冲区无效: {0}")]
  InvalidBuffer(String),
  #[error("没有可用的缩放方式处理 {src:?} -> {dst:?}")]
  Unsupported { src: PixelFormat, dst: PixelFormat },
}

/// Letterbox 预处理器
pub struct Letterboxer {
  strategies: Vec<Box<dyn Resize>>,
  accelerated: usize,
  fill: u8,
}

impl Default for Letterboxer {
  fn default() -> Self {
    Self::new(0)
  }
}

impl Letterboxer {
  /// 仅包含软件最近邻缩放的预处理器
  pub fn new(fill: u8) -> Self {
    Self {
      strategies: vec![Box::new(NearestRgb888)],
      accelerated: 0,
      fill,
    }
  }

  /// 追加一个加速缩放实现, 排在所有软件实现之前、已有加速实现之后
  pub fn with_accelerator(mut self, resize: Box<dyn Resize>) -> Self {
    self.strategies.insert(self.accelerated, resize);
    self.accelerated += 1;
    self
  }

  pub fn fill_value(&self) -> u8 {
    self.fill
  }

  pub fn strategy_names(&self) -> Vec<&'static str> {
    self.strategies.iter().map(|s| s.name()).collect()
  }

  /// 把 `src` 等比缩放到 `dst` 中央, 返回本帧使用的变换
  ///
  /// `dst` 先整体填充为填充值, 再写入缩放后的图像。
  pub fn letterbox(&self, src: &Frame, dst: &mut Frame) -> Result<LetterboxTransform, LetterboxError> {
    let transform =
      LetterboxTransform::compute(src.width(), src.height(), dst.width(), dst.height());
    if transform.scaled_width == 0 || transform.scaled_height == 0 {
      return Err(LetterboxError::InvalidBuffer(format!(
        "{}x{} 缩放到 {}x{} 后尺寸为零",
        src.width(),
        src.height(),
        dst.width(),
        dst.height()
      )));
    }

    debug!(
      "Letterbox: 源 {}x{}, 目标 {}x{}, 缩放后 {}x{}, 边距 ({}, {})",
      src.width(),
      src.height(),
      dst.width(),
      dst.height(),
      transform.scaled_width,
      transform.scaled_height,
      transform.x_pad,
      transform.y_pad
    );

    let src_rect = Rect::of_frame(src);
    let dst_rect = transform.content_rect();

    for (attempt, strategy) in self.strategies.iter().enumerate() {
      // 失败的实现可能已经写入了部分像素
      dst.data_mut().fill(self.fill);

      match strategy.resize(src, src_rect, dst, dst_rect) {
        Ok(()) => {
          debug!("{} 缩放成功", strategy.name());
          return Ok(transform);
        }
        Err(e) if attempt < self.accelerated => {
          warn!("{} 缩放失败, 回退到下一种实现: {}", strategy.name(), e);
        }
        Err(e) => {
          debug!("{} 缩放失败: {}", strategy.name(), e);
        }
      }
    }

    Err(LetterboxError::Unsupported {
      src: src.format(),
      dst: dst.format(),
    })
  }
}
