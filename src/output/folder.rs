// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/folder.rs - 目录记录输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};

use chrono::{Datelike, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, PixelFormat},
  model::{DetectResult, coco_label},
  output::Render,
};

#[derive(Error, Debug)]
pub enum FolderOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  Image(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("不支持保存 {0:?} 格式的帧")]
  UnsupportedFormat(PixelFormat),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
  /// 每行: 类别, 置信度, x_min, y_min, x_max, y_max
  Text { label_with_name: bool },
  Json,
}

/// 把检测结果写到与图像同名的文本文件
#[derive(Debug, Clone, Copy)]
pub struct Record {
  pub format: RecordFormat,
}

impl Record {
  pub fn record(&self, result: &DetectResult, path: &Path) -> Result<(), std::io::Error> {
    match self.format {
      RecordFormat::Text { label_with_name } => {
        let mut records = Vec::new();
        for item in result.items.iter() {
          let name = if label_with_name {
            coco_label(item.class_id).to_string()
          } else {
            item.class_id.to_string()
          };
          records.push(format!(
            "{}, {:.4}, {:.1}, {:.1}, {:.1}, {:.1}",
            name, item.score, item.bbox[0], item.bbox[1], item.bbox[2], item.bbox[3]
          ));
        }
        std::fs::write(path.with_extension("txt"), records.join("\n"))
      }
      RecordFormat::Json => {
        let items = result
          .items
          .iter()
          .map(|item| {
            serde_json::json!({
              "class_id": item.class_id,
              "label": coco_label(item.class_id),
              "score": item.score,
              "bbox": item.bbox,
            })
          })
          .collect::<Vec<_>>();
        let text = serde_json::to_string_pretty(&items)?;
        std::fs::write(path.with_extension("json"), text)
      }
    }
  }
}

/// 按日期分目录保存帧, 可选地在旁边写检测记录
///
/// `folder:///data/records?record=name&always`
/// - `record=name|id|json`: 额外写出检测记录
/// - `always`: 没有检测结果的帧也保存
pub struct FolderOutput {
  directory: PathBuf,
  record: Option<Record>,
  frame_counter: Mutex<u16>,
  always: bool,
}

impl FromUrlWithScheme for FolderOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for FolderOutput {
  type Error = FolderOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(FolderOutputError::SchemeMismatch);
    }

    let record = uri
      .query_pairs()
      .find(|(k, _)| k == "record")
      .map(|(_, v)| match v.as_ref() {
        "id" => RecordFormat::Text {
          label_with_name: false,
        },
        "json" => RecordFormat::Json,
        _ => RecordFormat::Text {
          label_with_name: true,
        },
      });
    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(FolderOutput::new(uri.path()).record(record).always(always))
  }
}

impl FolderOutput {
  pub fn new(directory: impl AsRef<Path>) -> Self {
    Self {
      directory: directory.as_ref().to_path_buf(),
      record: None,
      frame_counter: Mutex::new(0),
      always: false,
    }
  }

  pub fn record(mut self, format: Option<RecordFormat>) -> Self {
    self.record = format.map(|format| Record { format });
    self
  }

  pub fn always(mut self, always: bool) -> Self {
    self.always = always;
    self
  }

  fn frame_id(&self) -> u16 {
    let mut counter = self.frame_counter.lock();
    *counter = counter.wrapping_add(1);
    *counter
  }

  fn frame_path(&self) -> Result<PathBuf, FolderOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl Render for FolderOutput {
  type Error = FolderOutputError;

  fn render_result(&self, frame: &Frame, result: &DetectResult) -> Result<(), Self::Error> {
    if !self.always && result.is_empty() {
      return Ok(());
    }

    let image = frame
      .to_rgb_image()
      .ok_or(FolderOutputError::UnsupportedFormat(frame.format()))?;
    let path = self.frame_path()?;
    image.save(&path)?;
    if let Some(record) = &self.record {
      record.record(result, &path)?;
    }

    debug!("保存帧到 {}", path.display());
    Ok(())
  }
}
