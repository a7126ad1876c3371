// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};

use image::ImageReader;
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemaMismatch,
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("目录中没有图像文件: {0}")]
  NoImages(String),
  #[error("参数 repeat 无效: {0}")]
  InvalidRepeat(String),
}

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// 单个图像文件或目录下的所有图像文件, 按文件名排序
///
/// `image:///data/frames?repeat=100` 会把文件列表重复 100 遍。
pub struct ImageFileInput {
  files: Vec<PathBuf>,
  repeat: usize,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let repeat = match url.query_pairs().find(|(k, _)| k == "repeat") {
      Some((_, v)) => v
        .parse()
        .map_err(|_| ImageFileInputError::InvalidRepeat(v.to_string()))?,
      None => 1,
    };

    Ok(ImageFileInput::open(url.path())?.repeat(repeat))
  }
}

impl ImageFileInput {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageFileInputError> {
    let path = path.as_ref();
    let files = if path.is_dir() {
      let mut files = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_image_file(p))
        .collect::<Vec<_>>();
      files.sort();
      if files.is_empty() {
        return Err(ImageFileInputError::NoImages(path.display().to_string()));
      }
      files
    } else {
      // 提前暴露不存在的路径
      std::fs::metadata(path)?;
      vec![path.to_path_buf()]
    };

    debug!("图像输入: {} 个文件", files.len());
    Ok(Self { files, repeat: 1 })
  }

  pub fn repeat(mut self, repeat: usize) -> Self {
    self.repeat = repeat.max(1);
    self
  }

  pub fn len(&self) -> usize {
    self.files.len() * self.repeat
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }
}

fn is_image_file(path: &Path) -> bool {
  path
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
    .unwrap_or(false)
}

fn load_frame(path: &Path) -> Option<Frame> {
  let image = match ImageReader::open(path).map(|r| r.decode()) {
    Ok(Ok(image)) => image,
    Ok(Err(e)) => {
      warn!("无法解码图像 {}: {}", path.display(), e);
      return None;
    }
    Err(e) => {
      warn!("无法打开图像 {}: {}", path.display(), e);
      return None;
    }
  };

  match Frame::try_from(image.into_rgb8()) {
    Ok(frame) => Some(frame),
    Err(e) => {
      warn!("图像 {} 无法转换为帧: {}", path.display(), e);
      None
    }
  }
}

impl IntoIterator for ImageFileInput {
  type Item = Frame;
  type IntoIter = ImageFileFrames;

  fn into_iter(self) -> Self::IntoIter {
    ImageFileFrames {
      files: self.files,
      repeat: self.repeat,
      position: 0,
    }
  }
}

/// 逐个解码图像文件, 无法解码的文件被跳过
pub struct ImageFileFrames {
  files: Vec<PathBuf>,
  repeat: usize,
  position: usize,
}

impl Iterator for ImageFileFrames {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    while self.position < self.files.len() * self.repeat {
      let path = &self.files[self.position % self.files.len()];
      self.position += 1;
      if let Some(frame) = load_frame(path) {
        return Some(frame);
      }
    }
    None
  }
}
