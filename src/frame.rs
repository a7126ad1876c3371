// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - 帧定义
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

use image::RgbImage;
use thiserror::Error;

/// 帧像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
  Rgb888,
  Rgba8888,
  Gray8,
  /// YUV420 半平面, UV 交错
  Yuv420SpNv12,
  /// YUV420 半平面, VU 交错
  Yuv420SpNv21,
}

impl PixelFormat {
  /// 打包格式的每像素字节数, 半平面格式返回 `None`
  pub fn bytes_per_pixel(self) -> Option<usize> {
    match self {
      PixelFormat::Rgb888 => Some(3),
      PixelFormat::Rgba8888 => Some(4),
      PixelFormat::Gray8 => Some(1),
      PixelFormat::Yuv420SpNv12 | PixelFormat::Yuv420SpNv21 => None,
    }
  }

  /// 一行像素所需的最小字节数
  pub fn min_stride(self, width: u32) -> usize {
    self.bytes_per_pixel().unwrap_or(1) * width as usize
  }

  /// 给定行跨度时整帧所需的字节数
  pub fn buffer_size(self, height: u32, stride: usize) -> usize {
    match self {
      PixelFormat::Yuv420SpNv12 | PixelFormat::Yuv420SpNv21 => stride * height as usize * 3 / 2,
      _ => stride * height as usize,
    }
  }

  /// 按模型输入通道数选择对应的打包格式
  pub fn from_channels(channels: u32) -> Option<Self> {
    match channels {
      1 => Some(PixelFormat::Gray8),
      3 => Some(PixelFormat::Rgb888),
      4 => Some(PixelFormat::Rgba8888),
      _ => None,
    }
  }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
  #[error("帧尺寸无效: {width}x{height}")]
  InvalidShape { width: u32, height: u32 },
  #[error("行跨度无效: {stride} 字节, 最小 {min} 字节")]
  InvalidStride { stride: usize, min: usize },
  #[error("缓冲区长度不匹配: 期望至少 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("YUV420 半平面格式要求宽高为偶数: {width}x{height}")]
  OddChromaShape { width: u32, height: u32 },
}

/// 一帧图像
///
/// 提交到推理池之后不再修改, 直到被驱动方取回。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  data: Box<[u8]>,
  width: u32,
  height: u32,
  stride: usize,
  format: PixelFormat,
}

impl Frame {
  pub fn new(
    data: Vec<u8>,
    width: u32,
    height: u32,
    stride: usize,
    format: PixelFormat,
  ) -> Result<Self, FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::InvalidShape { width, height });
    }

    if matches!(
      format,
      PixelFormat::Yuv420SpNv12 | PixelFormat::Yuv420SpNv21
    ) && (width % 2 != 0 || height % 2 != 0)
    {
      return Err(FrameError::OddChromaShape { width, height });
    }

    let min = format.min_stride(width);
    if stride < min {
      return Err(FrameError::InvalidStride { stride, min });
    }

    let expected = format.buffer_size(height, stride);
    if data.len() < expected {
      return Err(FrameError::BufferSizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
      width,
      height,
      stride,
      format,
    })
  }

  /// 无行填充的紧凑帧
  pub fn packed(
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
  ) -> Result<Self, FrameError> {
    let stride = format.min_stride(width);
    Self::new(data, width, height, stride, format)
  }

  /// 以常量填充的紧凑帧
  pub fn filled(width: u32, height: u32, format: PixelFormat, value: u8) -> Result<Self, FrameError> {
    let stride = format.min_stride(width);
    let size = format.buffer_size(height, stride);
    Self::new(vec![value; size], width, height, stride, format)
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn stride(&self) -> usize {
    self.stride
  }

  pub fn format(&self) -> PixelFormat {
    self.format
  }

  pub fn is_packed(&self) -> bool {
    self.stride == self.format.min_stride(self.width)
  }

  pub fn data(&self) -> &[u8] {
    &self.data
  }

  pub fn data_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }

  /// 第 `y` 行的有效像素字节 (不含行尾填充)
  pub fn row(&self, y: u32) -> &[u8] {
    let start = y as usize * self.stride;
    &self.data[start..start + self.format.min_stride(self.width)]
  }

  /// 转为 RGB 图像, 仅支持 RGB888 帧
  pub fn to_rgb_image(&self) -> Option<RgbImage> {
    if self.format != PixelFormat::Rgb888 {
      return None;
    }

    let mut raw = Vec::with_capacity(self.format.min_stride(self.width) * self.height as usize);
    for y in 0..self.height {
      raw.extend_from_slice(self.row(y));
    }
    RgbImage::from_raw(self.width, self.height, raw)
  }
}

impl AsRef<[u8]> for Frame {
  fn as_ref(&self) -> &[u8] {
    &self.data
  }
}

impl AsMut<[u8]> for Frame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl TryFrom<RgbImage> for Frame {
  type Error = FrameError;

  fn try_from(image: RgbImage) -> Result<Self, Self::Error> {
    let (width, height) = image.dimensions();
    Frame::packed(image.into_raw(), width, height, PixelFormat::Rgb888)
  }
}
