// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};

use ab_glyph::{FontArc, InvalidFont, PxScale};
use image::{GenericImage, ImageBuffer, Pixel, Rgb, Rgba, imageops};
use imageproc::{
  drawing::{draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;
use tracing::debug;

use crate::{
  frame::{Frame, PixelFormat},
  model::{DetectItem, DetectResult, coco_label},
};

const BOX_THICKNESS: u32 = 2;
const LABEL_SCALE: f32 = 16.0;

// 按类别循环取色
const PALETTE: [[u8; 3]; 8] = [
  [0, 0, 255],
  [255, 56, 56],
  [72, 249, 10],
  [255, 178, 29],
  [0, 194, 255],
  [255, 55, 199],
  [146, 204, 23],
  [132, 56, 255],
];

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("无法读取字体文件 {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("字体文件 {path} 无效: {source}")]
  InvalidFont {
    path: PathBuf,
    #[source]
    source: InvalidFont,
  },
}

/// 读取 TTF/OTF 字体, 用于在检测框上标注类别
pub fn load_font(path: impl AsRef<Path>) -> Result<FontArc, DrawError> {
  let path = path.as_ref();
  let data = std::fs::read(path).map_err(|source| DrawError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  let font = FontArc::try_from_vec(data).map_err(|source| DrawError::InvalidFont {
    path: path.to_path_buf(),
    source,
  })?;
  debug!("加载字体: {}", path.display());
  Ok(font)
}

/// 在帧上画检测框, 检测框为原图像素坐标
///
/// 设置了字体时, 在框的上方写 `类别 置信度%`。
#[derive(Debug, Clone)]
pub struct Draw {
  thickness: u32,
  palette: Vec<[u8; 3]>,
  font: Option<FontArc>,
  scale: PxScale,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      thickness: BOX_THICKNESS,
      palette: PALETTE.to_vec(),
      font: None,
      scale: PxScale::from(LABEL_SCALE),
    }
  }
}

impl Draw {
  pub fn thickness(mut self, thickness: u32) -> Self {
    self.thickness = thickness.max(1);
    self
  }

  pub fn font(mut self, font: Option<FontArc>) -> Self {
    self.font = font;
    self
  }

  pub fn font_scale(mut self, scale: f32) -> Self {
    self.scale = PxScale::from(scale);
    self
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  pub fn color_of(&self, class_id: u32) -> [u8; 3] {
    self.palette[class_id as usize % self.palette.len()]
  }

  /// 就地画框; 帧格式不支持时返回 `false`, 帧保持不变
  pub fn draw_detections(&self, frame: &mut Frame, result: &DetectResult) -> bool {
    match frame.format() {
      PixelFormat::Rgb888 => self.draw_on::<Rgb<u8>>(frame, result, Rgb),
      PixelFormat::Rgba8888 => {
        self.draw_on::<Rgba<u8>>(frame, result, |[r, g, b]| Rgba([r, g, b, 255]))
      }
      _ => false,
    }
  }

  fn draw_on<P: Pixel<Subpixel = u8>>(
    &self,
    frame: &mut Frame,
    result: &DetectResult,
    color: impl Fn([u8; 3]) -> P,
  ) -> bool {
    let channels = P::CHANNEL_COUNT as usize;
    let (width, height) = (frame.width(), frame.height());
    if frame.stride() % channels != 0 {
      return false;
    }

    // 行尾填充当作额外的列, 只在有效宽度的视图里画
    let canvas_width = (frame.stride() / channels) as u32;
    let Some(mut buffer) =
      ImageBuffer::<P, &mut [u8]>::from_raw(canvas_width, height, frame.data_mut())
    else {
      return false;
    };
    let mut view = imageops::crop(&mut buffer, 0, 0, width, height);

    for item in result.items.iter() {
      let Some((x_min, y_min, x_max, y_max)) = clamp_box(&item.bbox, width, height) else {
        continue;
      };

      let pixel = color(self.color_of(item.class_id));
      for t in 0..self.thickness as i32 {
        let (left, top) = (x_min + t, y_min + t);
        let (w, h) = (x_max - x_min - 2 * t + 1, y_max - y_min - 2 * t + 1);
        if w <= 0 || h <= 0 {
          break;
        }
        draw_hollow_rect_mut(&mut *view, Rect::at(left, top).of_size(w as u32, h as u32), pixel);
      }

      if let Some(font) = &self.font {
        self.draw_label(&mut *view, font, item, (x_min, y_min), pixel);
      }
    }

    true
  }

  fn draw_label<C, P>(&self, canvas: &mut C, font: &FontArc, item: &DetectItem, at: (i32, i32), pixel: P)
  where
    C: GenericImage<Pixel = P>,
    P: Pixel<Subpixel = u8>,
  {
    let text = label_text(item);
    let (_, text_height) = text_size(self.scale, font, &text);
    // 框上方放不下时写在框内
    let y = match at.1 - text_height as i32 {
      y if y >= 0 => y,
      _ => at.1 + self.thickness as i32,
    };
    draw_text_mut(canvas, pixel, at.0, y, self.scale, font, &text);
  }
}

/// `person 87.5%`
pub fn label_text(item: &DetectItem) -> String {
  format!("{} {:.1}%", coco_label(item.class_id), item.score * 100.0)
}

fn clamp_box(bbox: &[f32; 4], width: u32, height: u32) -> Option<(i32, i32, i32, i32)> {
  if width == 0 || height == 0 {
    return None;
  }
  let (w, h) = (width as i32, height as i32);

  let x_min = (bbox[0].floor() as i32).clamp(0, w - 1);
  let y_min = (bbox[1].floor() as i32).clamp(0, h - 1);
  let x_max = (bbox[2].ceil() as i32).clamp(0, w - 1);
  let y_max = (bbox[3].ceil() as i32).clamp(0, h - 1);

  if x_min >= x_max || y_min >= y_max {
    return None;
  }
  Some((x_min, y_min, x_max, y_max))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn one_box(bbox: [f32; 4]) -> DetectResult {
    DetectResult::bounded(vec![DetectItem {
      class_id: 0,
      score: 0.9,
      bbox,
    }])
  }

  fn pixel(frame: &Frame, x: u32, y: u32) -> [u8; 3] {
    let row = frame.row(y);
    let i = x as usize * 3;
    [row[i], row[i + 1], row[i + 2]]
  }

  #[test]
  fn draws_two_pixel_border() {
    let mut frame = Frame::filled(10, 10, PixelFormat::Rgb888, 0).unwrap();
    let draw = Draw::default();
    assert!(draw.draw_detections(&mut frame, &one_box([2.0, 2.0, 7.0, 7.0])));

    let color = draw.color_of(0);
    assert_eq!(pixel(&frame, 2, 2), color);
    assert_eq!(pixel(&frame, 3, 3), color);
    assert_eq!(pixel(&frame, 7, 5), color);
    assert_eq!(pixel(&frame, 4, 4), [0, 0, 0]);
    assert_eq!(pixel(&frame, 1, 1), [0, 0, 0]);
  }

  #[test]
  fn keeps_row_padding_untouched() {
    let data = vec![0xAA; 4 * 12];
    let mut frame = Frame::new(data, 3, 4, 12, PixelFormat::Rgb888).unwrap();
    assert!(Draw::default().draw_detections(&mut frame, &one_box([-5.0, -5.0, 50.0, 50.0])));

    for y in 0..4 {
      let start = y * 12;
      assert_eq!(&frame.data()[start + 9..start + 12], &[0xAA; 3]);
    }
  }

  #[test]
  fn skips_formats_without_rgb_pixels() {
    let mut frame = Frame::filled(8, 8, PixelFormat::Gray8, 3).unwrap();
    let before = frame.clone();
    assert!(!Draw::default().draw_detections(&mut frame, &one_box([1.0, 1.0, 6.0, 6.0])));
    assert_eq!(frame, before);
  }

  #[test]
  fn degenerate_boxes_are_ignored() {
    let mut frame = Frame::filled(8, 8, PixelFormat::Rgb888, 0).unwrap();
    let before = frame.clone();
    assert!(Draw::default().draw_detections(&mut frame, &one_box([3.0, 3.0, 3.0, 6.0])));
    assert_eq!(frame, before);
  }

  #[test]
  fn label_reads_class_and_percent() {
    let item = DetectItem {
      class_id: 2,
      score: 0.875,
      bbox: [0.0; 4],
    };
    assert_eq!(label_text(&item), "car 87.5%");
  }

  #[test]
  fn rejects_files_that_are_not_fonts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.ttf");
    std::fs::write(&path, b"not a font").unwrap();

    assert!(matches!(load_font(&path), Err(DrawError::InvalidFont { .. })));
    assert!(matches!(
      load_font(dir.path().join("missing.ttf")),
      Err(DrawError::Io { .. })
    ));
  }

  #[test]
  fn labels_are_written_above_the_box() {
    // 依赖系统字体, 找不到时跳过
    let Some(font) = [
      "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
      "/usr/share/fonts/dejavu/DejaVuSans.ttf",
      "/usr/share/fonts/TTF/DejaVuSans.ttf",
    ]
    .iter()
    .find_map(|path| load_font(path).ok()) else {
      return;
    };

    let mut frame = Frame::filled(64, 64, PixelFormat::Rgb888, 0).unwrap();
    let draw = Draw::default().font(Some(font));
    assert!(draw.draw_detections(&mut frame, &one_box([10.0, 40.0, 50.0, 60.0])));

    let labelled = (20..40).any(|y| (10..50).any(|x| pixel(&frame, x, y) != [0, 0, 0]));
    assert!(labelled);
  }
}
