// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/yolo26.rs - YOLO26 后处理
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use tracing::{debug, error};

use crate::{
  model::{DetectItem, DetectResult, ModelMeta, PostProcess},
  runtime::RawOutputs,
};

const YOLO26_CLASS_NUM: usize = 80;
const YOLO26_STRIDES: [u32; 3] = [8, 16, 32];
const YOLO26_BOX_THRESH: f32 = 0.25;
const YOLO26_NMS_THRESH: f32 = 0.45;

/// YOLO26 六输出检测头的解码
///
/// 每个步长对应一对输出 (回归, 分类), 两者的先后顺序按张量大小判定。
#[derive(Debug, Clone)]
pub struct Yolo26PostProcess {
  class_num: usize,
  box_threshold: f32,
  nms_threshold: Option<f32>,
}

impl Default for Yolo26PostProcess {
  fn default() -> Self {
    Self {
      class_num: YOLO26_CLASS_NUM,
      box_threshold: YOLO26_BOX_THRESH,
      nms_threshold: Some(YOLO26_NMS_THRESH),
    }
  }
}

impl Yolo26PostProcess {
  pub fn class_num(mut self, class_num: usize) -> Self {
    self.class_num = class_num;
    self
  }

  pub fn box_threshold(mut self, threshold: f32) -> Self {
    self.box_threshold = threshold;
    self
  }

  /// `None` 关闭 NMS
  pub fn nms_threshold(mut self, threshold: Option<f32>) -> Self {
    self.nms_threshold = threshold;
    self
  }

  fn decode_head(
    &self,
    reg: &[f32],
    cls: &[f32],
    (map_h, map_w): (usize, usize),
    stride: f32,
    (input_w, input_h): (f32, f32),
    items: &mut Vec<DetectItem>,
  ) {
    let spatial = map_h * map_w;

    for h in 0..map_h {
      for w in 0..map_w {
        let idx = h * map_w + w;

        let (score, class_id) = {
          let mut max_logit = f32::MIN;
          let mut cls_idx = 0usize;
          for c in 0..self.class_num {
            let logit = cls[c * spatial + idx];
            if logit > max_logit {
              max_logit = logit;
              cls_idx = c;
            }
          }
          (sigmoid(max_logit), cls_idx as u32)
        };

        if score <= self.box_threshold {
          continue;
        }

        let grid_x = (w as f32) + 0.5;
        let grid_y = (h as f32) + 0.5;

        let xmin = ((grid_x - reg[idx]) * stride).clamp(0.0, input_w);
        let ymin = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, input_h);
        let xmax = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, input_w);
        let ymax = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, input_h);

        if xmax > xmin && ymax > ymin {
          items.push(DetectItem {
            class_id,
            score,
            bbox: [xmin, ymin, xmax, ymax],
          });
        }
      }
    }
  }
}

impl PostProcess for Yolo26PostProcess {
  fn postprocess(&self, output: &RawOutputs, meta: &ModelMeta) -> DetectResult {
    let input_size = (meta.width as f32, meta.height as f32);
    let mut items = Vec::new();

    for (head_idx, stride) in YOLO26_STRIDES.into_iter().enumerate() {
      let map_size = ((meta.height / stride) as usize, (meta.width / stride) as usize);
      let spatial = map_size.0 * map_size.1;
      let reg_expected = 4 * spatial;
      let cls_expected = self.class_num * spatial;

      let output_idx1 = head_idx * 2;
      let output_idx2 = head_idx * 2 + 1;

      let (tensor1, tensor2) = match (output.get_f32(output_idx1), output.get_f32(output_idx2)) {
        (Ok(t1), Ok(t2)) => (t1, t2),
        (Err(e), _) | (_, Err(e)) => {
          error!("检测头 {} 获取输出失败: {}", head_idx, e);
          continue;
        }
      };

      let Some((reg, cls)) = match_reg_cls_tensors(
        tensor1,
        tensor2,
        reg_expected,
        cls_expected,
        head_idx,
      ) else {
        continue;
      };

      self.decode_head(reg, cls, map_size, stride as f32, input_size, &mut items);
    }

    if let Some(threshold) = self.nms_threshold {
      items = nms(items, threshold);
    }

    debug!("检测到 {} 个物体", items.len());
    DetectResult::bounded(items)
  }
}

/// 根据张量大小匹配回归和分类输出
fn match_reg_cls_tensors<'a>(
  tensor1: &'a [f32],
  tensor2: &'a [f32],
  reg_expected: usize,
  cls_expected: usize,
  head_idx: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  if tensor1.len() == reg_expected && tensor2.len() == cls_expected {
    Some((tensor1, tensor2))
  } else if tensor1.len() == cls_expected && tensor2.len() == reg_expected {
    debug!("检测头 {}: 输出顺序交换", head_idx);
    Some((tensor2, tensor1))
  } else {
    error!(
      "检测头 {}: 输出大小不匹配 - 张量1: {}, 张量2: {}, 期望回归: {}, 期望分类: {}",
      head_idx,
      tensor1.len(),
      tensor2.len(),
      reg_expected,
      cls_expected
    );
    None
  }
}

/// 同类别内的非极大值抑制
fn nms(mut items: Vec<DetectItem>, threshold: f32) -> Vec<DetectItem> {
  items.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut kept: Vec<DetectItem> = Vec::with_capacity(items.len());
  for item in items {
    let suppressed = kept
      .iter()
      .any(|best| best.class_id == item.class_id && iou(&best.bbox, &item.bbox) >= threshold);
    if !suppressed {
      kept.push(item);
    }
  }
  kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - intersection;

  if union > 0.0 { intersection / union } else { 0.0 }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
