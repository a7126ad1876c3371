// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/pool.rs - 线程池测试
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

mod common;

use std::{
  sync::atomic::Ordering,
  time::{Duration, Instant},
};

use common::*;
use shanan_pool::{
  frame::{Frame, PixelFormat},
  model::{DetectResult, FrameStatus, ModelMeta, PostProcess},
  pool::{PoolBuilder, PoolError, RetrieveError, SubmitError, Ticket, WorkerPool},
  runtime::RawOutputs,
};

const WAIT: Duration = Duration::from_secs(5);

fn build(script: Script, workers: usize, depth: usize) -> (WorkerPool<FakeRuntime>, std::sync::Arc<Counters>) {
  let model = model_file();
  let (runtime, counters) = FakeRuntime::new(script);
  let pool = PoolBuilder::new(model.path())
    .workers(workers)
    .queue_depth(depth)
    .build(runtime, post())
    .unwrap();
  (pool, counters)
}

fn build_err(script: Script, workers: usize) -> (PoolError, std::sync::Arc<Counters>) {
  let model = model_file();
  let (runtime, counters) = FakeRuntime::new(script);
  let err = PoolBuilder::new(model.path())
    .workers(workers)
    .build(runtime, post())
    .err()
    .unwrap();
  (err, counters)
}

fn jitter(tag: u8, handle: usize) -> Duration {
  Duration::from_millis(((tag as u64 * 7 + handle as u64 * 13) % 11) + 1)
}

#[test]
fn results_follow_submission_order_under_jittered_latency() {
  let (pool, counters) = build(
    Script {
      latency: Some(jitter),
      ..Default::default()
    },
    4,
    64,
  );

  let tickets = (0..48u8)
    .map(|tag| pool.submit(tagged_frame(tag)).unwrap())
    .collect::<Vec<_>>();
  assert_eq!(tickets, (0..48).map(Ticket).collect::<Vec<_>>());

  for expected in 0..48u8 {
    let (ticket, result) = pool.retrieve_timeout(WAIT).unwrap();
    assert_eq!(ticket, Ticket(expected as u64));
    assert_eq!(result.status, FrameStatus::Detected);
    assert_eq!(tag_of(&result.detections), Some(expected));
    assert_eq!(result.frame.row(0)[0], expected);
    assert_eq!(result.worker, Some(expected as usize % 4));
  }

  assert_eq!(pool.try_retrieve().err(), Some(RetrieveError::Empty));
  assert_eq!(counters.overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn try_retrieve_never_skips_the_head() {
  fn slow_head(tag: u8, _: usize) -> Duration {
    if tag == 0 {
      Duration::from_millis(150)
    } else {
      Duration::from_millis(1)
    }
  }

  let (pool, _) = build(
    Script {
      latency: Some(slow_head),
      ..Default::default()
    },
    2,
    4,
  );
  pool.submit(tagged_frame(0)).unwrap();
  pool.submit(tagged_frame(1)).unwrap();

  std::thread::sleep(Duration::from_millis(50));
  assert_eq!(pool.try_retrieve().err(), Some(RetrieveError::NotReady(Ticket(0))));

  let (t0, r0) = pool.retrieve_timeout(WAIT).unwrap();
  let (t1, r1) = pool.retrieve_timeout(WAIT).unwrap();
  assert_eq!((t0, tag_of(&r0.detections)), (Ticket(0), Some(0)));
  assert_eq!((t1, tag_of(&r1.detections)), (Ticket(1), Some(1)));
}

#[test]
fn submit_past_bound_is_full_without_blocking() {
  fn slow(_: u8, _: usize) -> Duration {
    Duration::from_millis(200)
  }

  let (pool, _) = build(
    Script {
      latency: Some(slow),
      ..Default::default()
    },
    2,
    3,
  );

  for tag in 0..3 {
    pool.submit(tagged_frame(tag)).unwrap();
  }

  let started = Instant::now();
  let rejected = match pool.submit(tagged_frame(99)) {
    Err(SubmitError::Full(frame)) => frame,
    other => panic!("expected a full queue, got {:?}", other.map(|_| ())),
  };
  assert!(started.elapsed() < Duration::from_millis(100));
  assert_eq!(rejected, tagged_frame(99));
  assert_eq!(pool.outstanding(), 3);

  for expected in 0..3u8 {
    let (ticket, result) = pool.retrieve_timeout(WAIT).unwrap();
    assert_eq!(ticket, Ticket(expected as u64));
    assert_eq!(tag_of(&result.detections), Some(expected));
  }

  // 被拒绝的提交不消耗票号
  assert_eq!(pool.submit(rejected).unwrap(), Ticket(3));
}

#[test]
fn default_queue_depth_is_twice_the_workers() {
  let model = model_file();
  let (runtime, _) = FakeRuntime::new(Script::default());
  let pool = PoolBuilder::new(model.path())
    .workers(3)
    .build(runtime, post())
    .unwrap();
  assert_eq!(pool.workers(), 3);
  assert_eq!(pool.queue_depth(), 6);
  assert_eq!(pool.meta().width, MODEL_SIZE);
}

#[test]
fn root_load_failure_creates_nothing() {
  let (err, counters) = build_err(
    Script {
      fail_load: true,
      ..Default::default()
    },
    3,
  );
  assert!(matches!(err, PoolError::Context { index: 0, .. }));
  assert_eq!(counters.created.load(Ordering::SeqCst), 0);
}

#[test]
fn duplicate_failure_releases_every_created_handle() {
  let (err, counters) = build_err(
    Script {
      fail_duplicate_at: Some(2),
      ..Default::default()
    },
    4,
  );
  assert!(matches!(err, PoolError::Context { index: 2, .. }));
  assert_eq!(counters.created.load(Ordering::SeqCst), 2);
  assert_eq!(counters.released.load(Ordering::SeqCst), 2);
  assert_eq!(counters.double_released.load(Ordering::SeqCst), 0);
  assert_eq!(counters.live(), 0);
}

#[test]
fn attribute_query_failure_on_a_duplicate_leaks_nothing() {
  // 每个句柄查询 4 次: 数量, 1 个输入, 2 个输出
  for at in 1..=4 {
    let (err, counters) = build_err(
      Script {
        fail_query: Some(QueryFailure { handle: 2, at }),
        ..Default::default()
      },
      4,
    );
    assert!(
      matches!(err, PoolError::Context { index: 2, .. }),
      "query {at}: {err}"
    );
    assert_eq!(counters.created.load(Ordering::SeqCst), 3);
    assert_eq!(counters.released.load(Ordering::SeqCst), 3);
    assert_eq!(counters.double_released.load(Ordering::SeqCst), 0);
    assert_eq!(counters.live(), 0);
  }
}

#[test]
fn every_handle_is_queried_independently() {
  let (pool, counters) = build(Script::default(), 3, 6);
  assert_eq!(counters.queries.load(Ordering::SeqCst), 3 * 4);
  assert_eq!(counters.duplicate_calls.load(Ordering::SeqCst), 2);
  drop(pool);
}

#[test]
fn shutdown_is_idempotent() {
  let (mut pool, counters) = build(Script::default(), 3, 6);
  pool.submit(tagged_frame(1)).unwrap();

  assert_eq!(pool.shutdown(), 3);
  assert_eq!(pool.shutdown(), 0);
  drop(pool);

  assert_eq!(counters.released.load(Ordering::SeqCst), 3);
  assert_eq!(counters.double_released.load(Ordering::SeqCst), 0);
  assert_eq!(counters.live(), 0);
}

#[test]
fn submit_after_shutdown_hands_the_frame_back() {
  let (mut pool, _) = build(Script::default(), 1, 2);
  pool.shutdown();
  assert!(matches!(
    pool.submit(tagged_frame(3)),
    Err(SubmitError::Closed(frame)) if frame == tagged_frame(3)
  ));
  assert_eq!(pool.try_retrieve().err(), Some(RetrieveError::Closed));
}

#[test]
fn dropping_a_busy_pool_waits_and_releases() {
  fn slow(_: u8, _: usize) -> Duration {
    Duration::from_millis(30)
  }

  let (pool, counters) = build(
    Script {
      latency: Some(slow),
      ..Default::default()
    },
    2,
    8,
  );
  for tag in 0..8 {
    pool.submit(tagged_frame(tag)).unwrap();
  }
  drop(pool);

  assert_eq!(counters.active.load(Ordering::SeqCst), 0);
  assert_eq!(counters.released.load(Ordering::SeqCst), 2);
  assert_eq!(counters.live(), 0);
}

#[test]
fn inference_failure_passes_the_frame_through() {
  let (pool, _) = build(
    Script {
      fail_run_tag: Some(5),
      ..Default::default()
    },
    1,
    4,
  );

  for tag in 4..7 {
    pool.submit(tagged_frame(tag)).unwrap();
  }

  let (_, ok) = pool.retrieve_timeout(WAIT).unwrap();
  let (_, failed) = pool.retrieve_timeout(WAIT).unwrap();
  let (_, after) = pool.retrieve_timeout(WAIT).unwrap();

  assert_eq!(ok.status, FrameStatus::Detected);
  assert_eq!(failed.status, FrameStatus::InferenceFailed);
  assert!(failed.detections.is_empty());
  assert_eq!(failed.frame, tagged_frame(5));
  // 同一个上下文继续可用
  assert_eq!(after.status, FrameStatus::Detected);
  assert_eq!(tag_of(&after.detections), Some(6));
}

#[test]
fn unsupported_frames_are_passed_through() {
  let (pool, counters) = build(Script::default(), 2, 4);
  let gray = Frame::filled(32, 32, PixelFormat::Gray8, 7).unwrap();
  pool.submit(gray.clone()).unwrap();

  let (_, result) = pool.retrieve_timeout(WAIT).unwrap();
  assert_eq!(result.status, FrameStatus::PreprocessFailed);
  assert_eq!(result.frame, gray);
  assert_eq!(counters.runs.load(Ordering::SeqCst), 0);
}

#[test]
fn no_context_serves_two_calls_at_once() {
  fn short(_: u8, _: usize) -> Duration {
    Duration::from_millis(2)
  }

  let (pool, counters) = build(
    Script {
      latency: Some(short),
      ..Default::default()
    },
    3,
    6,
  );

  let mut next = 0u8;
  let mut seen = Vec::new();
  while seen.len() < 60 {
    if next < 60 {
      match pool.submit(tagged_frame(next)) {
        Ok(_) => next += 1,
        Err(SubmitError::Full(_)) => {}
        Err(SubmitError::Closed(_)) => panic!("pool closed"),
      }
    }
    while let Ok((_, result)) = pool.try_retrieve() {
      seen.push(tag_of(&result.detections).unwrap());
    }
    if next == 60 && seen.len() < 60 {
      if let Ok((_, result)) = pool.retrieve_timeout(WAIT) {
        seen.push(tag_of(&result.detections).unwrap());
      }
    }
  }

  assert_eq!(seen, (0..60).collect::<Vec<u8>>());
  assert_eq!(counters.runs.load(Ordering::SeqCst), 60);
  assert_eq!(counters.overlaps.load(Ordering::SeqCst), 0);
  assert!(counters.max_active.load(Ordering::SeqCst) <= 3);
}

#[test]
fn source_coordinates_are_restored() {
  let (pool, _) = build(Script::default(), 1, 2);
  // 128x64 -> 64x64: 缩放 0.5, 上下各填充 16 行
  let frame = Frame::filled(128, 64, PixelFormat::Rgb888, 9).unwrap();
  pool.submit(frame).unwrap();

  let (_, result) = pool.retrieve_timeout(WAIT).unwrap();
  assert_eq!(result.frame.width(), 128);
  assert_eq!(result.detections.items[0].bbox, [32.0, 0.0, 96.0, 64.0]);
}

/// 标记值等于给定值时 panic
struct PanicOn(u8);

impl PostProcess for PanicOn {
  fn postprocess(&self, output: &RawOutputs, meta: &ModelMeta) -> DetectResult {
    if output.get_f32(0).map(|t| t[0] as u8).ok() == Some(self.0) {
      panic!("后处理失败");
    }
    TagPost.postprocess(output, meta)
  }
}

#[test]
fn panicking_post_process_does_not_stall_later_tickets() {
  let model = model_file();
  let (runtime, counters) = FakeRuntime::new(Script::default());
  let mut pool = PoolBuilder::new(model.path())
    .workers(2)
    .queue_depth(8)
    .build(runtime, std::sync::Arc::new(PanicOn(1)))
    .unwrap();

  for tag in 0..6 {
    pool.submit(tagged_frame(tag)).unwrap();
  }

  let mut statuses = Vec::new();
  for expected in 0..6u8 {
    let (ticket, result) = pool.retrieve_timeout(WAIT).unwrap();
    assert_eq!(ticket, Ticket(expected as u64));
    assert_eq!(result.frame.row(0)[0], expected);
    statuses.push(result.status);
  }
  assert_eq!(statuses[1], FrameStatus::InferenceFailed);
  assert!(
    statuses
      .iter()
      .enumerate()
      .all(|(i, status)| i == 1 || *status == FrameStatus::Detected)
  );

  // 出过 panic 的工作线程仍在运行, 上下文照常释放
  assert_eq!(pool.shutdown(), 2);
  drop(pool);
  assert_eq!(counters.live(), 0);
}

#[test]
fn unreadable_font_fails_before_any_context_is_created() {
  let model = model_file();
  let dir = tempfile::tempdir().unwrap();
  let font = dir.path().join("label.ttf");
  std::fs::write(&font, b"not a font").unwrap();

  let (runtime, counters) = FakeRuntime::new(Script::default());
  let err = PoolBuilder::new(model.path())
    .workers(2)
    .font(&font)
    .build(runtime, post())
    .err()
    .unwrap();

  assert!(matches!(err, PoolError::Font(_)));
  assert_eq!(counters.created.load(Ordering::SeqCst), 0);
}
