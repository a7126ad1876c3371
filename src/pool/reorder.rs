// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pool/reorder.rs - 按提交顺序重排结果
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

//! 重排队列
//!
//! 提交时领取递增的票号, 工作线程以任意顺序完成, 取结果时严格按票号顺序返回。
//! 票号的发放和容量检查在同一把锁下完成, 未取走的票号数量不会超过容量。

use std::{collections::HashMap, fmt, time::Duration, time::Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// 提交票号, 从 0 开始严格递增, 不会复用
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(pub u64);

impl fmt::Display for Ticket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveError {
  #[error("未取走的结果已达上限 {0}")]
  Full(usize),
  #[error("队列已关闭")]
  Closed,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieveError {
  #[error("票号 {0} 的结果尚未就绪")]
  NotReady(Ticket),
  #[error("没有未取走的票号")]
  Empty,
  #[error("队列已关闭")]
  Closed,
}

enum Slot<T> {
  InFlight,
  Ready(T),
}

struct State<T> {
  next_ticket: u64,
  next_expected: u64,
  slots: HashMap<u64, Slot<T>>,
  closed: bool,
}

impl<T> State<T> {
  fn pop(&mut self) -> Result<(Ticket, T), RetrieveError> {
    if self.closed {
      return Err(RetrieveError::Closed);
    }

    let ticket = self.next_expected;
    match self.slots.get(&ticket) {
      None => Err(RetrieveError::Empty),
      Some(Slot::InFlight) => Err(RetrieveError::NotReady(Ticket(ticket))),
      Some(Slot::Ready(_)) => match self.slots.remove(&ticket) {
        Some(Slot::Ready(value)) => {
          self.next_expected += 1;
          Ok((Ticket(ticket), value))
        }
        _ => Err(RetrieveError::Empty),
      },
    }
  }
}

pub struct ReorderQueue<T> {
  state: Mutex<State<T>>,
  ready: Condvar,
  capacity: usize,
}

impl<T> ReorderQueue<T> {
  /// `capacity` 为允许同时存在的未取走票号数量, 至少为 1
  pub fn new(capacity: usize) -> Self {
    Self {
      state: Mutex::new(State {
        next_ticket: 0,
        next_expected: 0,
        slots: HashMap::with_capacity(capacity),
        closed: false,
      }),
      ready: Condvar::new(),
      capacity: capacity.max(1),
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// 领取下一个票号, 已满时立即返回
  pub fn reserve(&self) -> Result<Ticket, ReserveError> {
    let mut state = self.state.lock();
    if state.closed {
      return Err(ReserveError::Closed);
    }
    if state.slots.len() >= self.capacity {
      return Err(ReserveError::Full(self.capacity));
    }

    let ticket = state.next_ticket;
    state.next_ticket += 1;
    state.slots.insert(ticket, Slot::InFlight);
    Ok(Ticket(ticket))
  }

  /// 填入票号对应的结果
  ///
  /// 票号未发放、已完成或队列已关闭时返回 `false`, 结果被丢弃。
  pub fn complete(&self, ticket: Ticket, value: T) -> bool {
    let mut state = self.state.lock();
    let head = state.next_expected;
    match state.slots.get_mut(&ticket.0) {
      Some(slot) if matches!(slot, Slot::InFlight) => {
        *slot = Slot::Ready(value);
        if ticket.0 == head {
          self.ready.notify_all();
        }
        true
      }
      _ => false,
    }
  }

  /// 非阻塞地取出下一个结果
  pub fn try_pop(&self) -> Result<(Ticket, T), RetrieveError> {
    self.state.lock().pop()
  }

  /// 等待下一个结果至多 `timeout`
  ///
  /// 没有未取走的票号时立即返回 [`RetrieveError::Empty`]。
  pub fn pop_timeout(&self, timeout: Duration) -> Result<(Ticket, T), RetrieveError> {
    let deadline = Instant::now() + timeout;
    let mut state = self.state.lock();
    loop {
      match state.pop() {
        Err(RetrieveError::NotReady(ticket)) => {
          if self.ready.wait_until(&mut state, deadline).timed_out() {
            return match state.pop() {
              Err(RetrieveError::NotReady(_)) => Err(RetrieveError::NotReady(ticket)),
              other => other,
            };
          }
        }
        other => return other,
      }
    }
  }

  /// 未取走的票号数量 (包括处理中和已完成的)
  pub fn outstanding(&self) -> usize {
    self.state.lock().slots.len()
  }

  /// 下一个要取出的票号
  pub fn next_expected(&self) -> Ticket {
    Ticket(self.state.lock().next_expected)
  }

  /// 关闭队列, 丢弃未取走的结果, 返回丢弃的数量
  pub fn close(&self) -> usize {
    let mut state = self.state.lock();
    state.closed = true;
    let discarded = state.slots.len();
    state.slots.clear();
    self.ready.notify_all();
    discarded
  }

  pub fn is_closed(&self) -> bool {
    self.state.lock().closed
  }
}
