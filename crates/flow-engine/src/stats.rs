//! 스트리밍 통계 -- Welford 온라인 알고리즘
//!
//! [`RunningStats`]는 패킷 이력을 저장하지 않고 평균/분산/최소/최대/합계를
//! O(1) 메모리로 누적합니다.
//!
//! # 수치 안정성
//! ```text
//! delta  = x - mean
//! mean  += delta / n
//! m2    += delta * (x - mean)
//! ```
//! 모집단 분산은 `m2 / n`, 표본 분산은 `m2 / (n - 1)`입니다.

/// Welford 누적기
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    sum: f64,
}

impl RunningStats {
    /// 빈 누적기를 생성합니다.
    pub const fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: 0.0,
            max: 0.0,
            sum: 0.0,
        }
    }

    /// 값을 추가합니다.
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;

        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// 누적된 값 개수
    pub fn count(&self) -> u64 {
        self.count
    }

    /// 합계
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// 평균 (비어 있으면 0)
    pub fn mean(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.mean }
    }

    /// 최솟값 (비어 있으면 0)
    pub fn min(&self) -> f64 {
        self.min
    }

    /// 최댓값 (비어 있으면 0)
    pub fn max(&self) -> f64 {
        self.max
    }

    /// 모집단 분산 (`m2 / n`)
    pub fn population_variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.m2 / self.count as f64).max(0.0)
    }

    /// 표본 분산 (`m2 / (n - 1)`)
    pub fn sample_variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).max(0.0)
    }

    /// 모집단 표준편차
    pub fn population_std(&self) -> f64 {
        self.population_variance().sqrt()
    }

    /// 표본 표준편차
    pub fn sample_std(&self) -> f64 {
        self.sample_variance().sqrt()
    }
}
