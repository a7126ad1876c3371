// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output.rs - 输出定义
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use thiserror::Error;
use url::Url;

use crate::{FromUrl, frame::Frame, model::DetectResult};
#[cfg(feature = "save_image_file")]
use crate::FromUrlWithScheme;

/// 消费按顺序取回的帧, 帧上已画好检测框, 检测框为原图像素坐标
pub trait Render {
  type Error;
  fn render_result(&self, frame: &Frame, result: &DetectResult) -> Result<(), Self::Error>;
}

pub mod draw;

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "save_image_file")]
mod folder;
#[cfg(feature = "save_image_file")]
pub use self::folder::{FolderOutput, FolderOutputError, Record, RecordFormat};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "save_image_file")]
  #[error("保存图像文件错误: {0}")]
  SaveImageFile(#[from] SaveImageFileError),
  #[cfg(feature = "save_image_file")]
  #[error("目录记录输出错误: {0}")]
  Folder(#[from] FolderOutputError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 按 URI 方案选择的输出
pub enum OutputWrapper {
  #[cfg(feature = "save_image_file")]
  SaveImageFile(SaveImageFileOutput),
  #[cfg(feature = "save_image_file")]
  Folder(FolderOutput),
  /// `null://`, 丢弃所有结果, 用于测速
  Discard,
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "save_image_file")]
      SaveImageFileOutput::SCHEME => Ok(OutputWrapper::SaveImageFile(
        SaveImageFileOutput::from_url(url)?,
      )),
      #[cfg(feature = "save_image_file")]
      FolderOutput::SCHEME => Ok(OutputWrapper::Folder(FolderOutput::from_url(url)?)),
      "null" => Ok(OutputWrapper::Discard),
      other => Err(OutputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl Render for OutputWrapper {
  type Error = OutputError;

  #[allow(unused_variables)]
  fn render_result(&self, frame: &Frame, result: &DetectResult) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFile(output) => Ok(output.render_result(frame, result)?),
      #[cfg(feature = "save_image_file")]
      OutputWrapper::Folder(output) => Ok(output.render_result(frame, result)?),
      OutputWrapper::Discard => Ok(()),
    }
  }
}
