//! 분류 요청 큐
//!
//! [`ClassificationQueue`]는 수집 경로에서 호출되는 [`FlowSink`] 구현입니다.
//! `submit`은 절대 대기하지 않으며, 용량이 차면 가장 오래된 요청을 버리고
//! overrun 카운터를 올립니다.
//!
//! ```text
//! lifecycle ──submit──▶ [ oldest ... newest ] ──pop──▶ classification workers
//!                           │ full
//!                           └─▶ drop oldest, overruns += 1
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use flowsentry_core::metrics as m;
use flowsentry_core::pipeline::FlowSink;
use flowsentry_core::types::FinalizedFlow;

/// 용량 제한 분류 큐 (drop-oldest)
pub struct ClassificationQueue {
    pending: Mutex<VecDeque<FinalizedFlow>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    submitted: AtomicU64,
    overruns: AtomicU64,
}

impl ClassificationQueue {
    /// 주어진 용량의 큐를 생성합니다. 용량 0은 1로 올립니다.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pending: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        }
    }

    /// 다음 요청을 꺼냅니다.
    ///
    /// 큐가 닫히고 비었을 때만 `None`을 반환합니다.
    pub async fn pop(&self) -> Option<FinalizedFlow> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(flow) = self.try_pop() {
                return Some(flow);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// 대기 없이 요청을 꺼냅니다.
    pub fn try_pop(&self) -> Option<FinalizedFlow> {
        let mut pending = self.pending.lock();
        let flow = pending.pop_front();
        if flow.is_some() {
            metrics::gauge!(m::CLASSIFIER_QUEUE_DEPTH).set(pending.len() as f64);
        }
        flow
    }

    /// 대기 중인 요청 수
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// 큐가 비었는지 여부
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// 최대 용량
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 용량 초과로 버려진 요청 수
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// 제출된 전체 요청 수
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// 큐를 닫습니다. 남은 요청은 계속 꺼낼 수 있습니다.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// 닫혔는지 여부
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl FlowSink for ClassificationQueue {
    fn submit(&self, flow: FinalizedFlow) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        if self.is_closed() {
            // 닫힌 뒤 도착한 요청도 overrun으로 집계
            self.overruns.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(m::CLASSIFIER_OVERRUNS_TOTAL).increment(1);
            debug!(flow = %flow.key, "classification queue closed, flow dropped");
            return;
        }

        {
            let mut pending = self.pending.lock();
            if pending.len() >= self.capacity {
                if let Some(dropped) = pending.pop_front() {
                    self.overruns.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(m::CLASSIFIER_OVERRUNS_TOTAL).increment(1);
                    debug!(flow = %dropped.key, "classification queue full, oldest dropped");
                }
            }
            pending.push_back(flow);
            metrics::gauge!(m::CLASSIFIER_QUEUE_DEPTH).set(pending.len() as f64);
        }
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use flowsentry_core::types::{
        Endpoint, FEATURE_COUNT, FeatureVector, FinalizeReason, FlowKey,
    };

    use super::*;

    fn flow(generation: u64) -> FinalizedFlow {
        let a = Endpoint::new("10.0.0.1".parse().unwrap(), 1000);
        let b = Endpoint::new("10.0.0.2".parse().unwrap(), 80);
        FinalizedFlow {
            key: FlowKey::new(6, a, b),
            forward: a,
            generation,
            reason: FinalizeReason::IdleTimeout,
            features: FeatureVector::new([0.0; FEATURE_COUNT]),
        }
    }

    #[test]
    fn overruns_equal_excess_submissions() {
        let queue = ClassificationQueue::new(100);
        for i in 0..1000 {
            queue.submit(flow(i));
        }
        assert_eq!(queue.len(), 100);
        assert_eq!(queue.submitted(), 1000);
        assert_eq!(queue.overruns(), 900);
        // 가장 오래된 요청부터 버려짐
        assert_eq!(queue.try_pop().unwrap().generation, 900);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let queue = ClassificationQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.submit(flow(1));
        queue.submit(flow(2));
        assert_eq!(queue.overruns(), 1);
    }

    #[tokio::test]
    async fn pop_waits_for_submit() {
        let queue = Arc::new(ClassificationQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.submit(flow(7));

        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.map(|f| f.generation), Some(7));
    }

    #[tokio::test]
    async fn close_drains_then_returns_none() {
        let queue = ClassificationQueue::new(4);
        queue.submit(flow(1));
        queue.close();

        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumer() {
        let queue = Arc::new(ClassificationQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(popped.is_none());
    }

    #[test]
    fn submit_after_close_counts_as_overrun() {
        let queue = ClassificationQueue::new(4);
        queue.close();
        queue.submit(flow(1));
        assert!(queue.is_empty());
        assert_eq!(queue.overruns(), 1);
    }
}
