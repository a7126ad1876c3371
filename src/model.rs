// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use crate::runtime::RawOutputs;

/// 单帧检测结果的最大数量
pub const MAX_DETECTIONS: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max], 像素坐标
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  /// 按置信度降序保留至多 [`MAX_DETECTIONS`] 个结果
  pub fn bounded(mut items: Vec<DetectItem>) -> Self {
    items.sort_by(|a, b| b.score.total_cmp(&a.score));
    items.truncate(MAX_DETECTIONS);
    Self {
      items: items.into_boxed_slice(),
    }
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  /// 对每个检测框做坐标变换
  pub fn map_boxes(self, f: impl Fn([f32; 4]) -> [f32; 4]) -> Self {
    let items = self
      .items
      .into_vec()
      .into_iter()
      .map(|item| DetectItem {
        bbox: f(item.bbox),
        ..item
      })
      .collect::<Vec<_>>();
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

/// 后处理: 把模型原始输出解码为检测框
///
/// 检测框使用模型输入坐标系 (letterbox 之后的像素坐标)。
pub trait PostProcess: Send + Sync {
  fn postprocess(&self, output: &RawOutputs, meta: &ModelMeta) -> DetectResult;
}

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
  "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
  "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
  "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
  "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
  "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
  "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
  "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
  "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
  "teddy bear", "hair drier", "toothbrush",
];

pub fn coco_label(class_id: u32) -> &'static str {
  COCO_CLASSES
    .get(class_id as usize)
    .copied()
    .unwrap_or("unknown")
}

mod context;
pub use self::context::{ContextError, ContextRole, FrameResult, FrameStatus, ModelContext, ModelMeta};

mod yolo26;
pub use self::yolo26::Yolo26PostProcess;
