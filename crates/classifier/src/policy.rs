//! 결정 정책 -- 분류 결과를 집행 액션으로 변환
//!
//! [`DecisionPolicy`]는 엔드포인트 쌍별 연속 악성 판정 횟수(streak)를
//! 추적하여 히스테리시스를 적용합니다.
//!
//! ```text
//! malicious && confidence >= threshold
//!   → streak += 1
//!   → streak >= hysteresis_count ? Drop : RateLimit(pps)
//! otherwise
//!   → streak 초기화, Allow
//! ```
//!
//! streak 맵은 `max_entries`로 제한되며 가장 오래 갱신되지 않은 엔트리부터
//! 제거됩니다. `ttl`이 지난 streak는 새로 시작합니다.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use flowsentry_core::types::{
    ClassificationResult, EndpointPair, EnforcementAction, EnforcementDecision, FailPolicy,
    FlowKey,
};

use crate::config::ClassifierPipelineConfig;

#[derive(Debug, Clone, Copy)]
struct Streak {
    count: u32,
    last_seen: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct StreakMap {
    entries: HashMap<EndpointPair, Streak>,
    /// (갱신 순번, 키) -- 순번이 엔트리와 다르면 이미 갱신된 기록
    order: VecDeque<(u64, EndpointPair)>,
    next_seq: u64,
}

impl StreakMap {
    fn touch(&mut self, pair: EndpointPair, count: u32, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            pair,
            Streak {
                count,
                last_seen: now,
                seq,
            },
        );
        self.order.push_back((seq, pair));
    }

    fn remove(&mut self, pair: &EndpointPair) {
        self.entries.remove(pair);
    }

    /// 최대 엔트리 수를 넘으면 가장 오래된 엔트리부터 제거합니다.
    fn enforce_bound(&mut self, max_entries: usize) {
        while self.entries.len() > max_entries {
            let Some((seq, pair)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&pair).is_some_and(|s| s.seq == seq) {
                self.entries.remove(&pair);
            }
        }
        if self.order.len() > max_entries.saturating_mul(2) {
            let entries = &self.entries;
            self.order
                .retain(|(seq, pair)| entries.get(pair).is_some_and(|s| s.seq == *seq));
        }
    }
}

/// 히스테리시스 결정 정책
pub struct DecisionPolicy {
    confidence_threshold: f64,
    hysteresis_count: u32,
    ttl: Duration,
    max_entries: usize,
    rate_limit_pps: u32,
    decision_ttl_secs: u64,
    fail_policy: FailPolicy,
    streaks: Mutex<StreakMap>,
}

impl DecisionPolicy {
    /// 파이프라인 설정으로 정책을 생성합니다.
    pub fn new(config: &ClassifierPipelineConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            hysteresis_count: config.hysteresis_count.max(1),
            ttl: config.hysteresis_ttl,
            max_entries: config.hysteresis_max_entries.max(1),
            rate_limit_pps: config.rate_limit_pps,
            decision_ttl_secs: config.decision_ttl_secs,
            fail_policy: config.fail_policy,
            streaks: Mutex::new(StreakMap::default()),
        }
    }

    /// 분류 결과에 대한 결정을 내립니다.
    pub fn decide(&self, result: &ClassificationResult) -> EnforcementDecision {
        self.decide_at(result, Instant::now())
    }

    /// 기준 시각을 지정하여 결정을 내립니다.
    pub fn decide_at(&self, result: &ClassificationResult, now: Instant) -> EnforcementDecision {
        let pair = result.flow_key.endpoint_pair();
        let mut streaks = self.streaks.lock();

        if !(result.is_malicious && result.confidence >= self.confidence_threshold) {
            streaks.remove(&pair);
            return self.decision(result.flow_key, EnforcementAction::Allow);
        }

        let count = match streaks.entries.get(&pair) {
            Some(s) if now.saturating_duration_since(s.last_seen) <= self.ttl => {
                s.count.saturating_add(1)
            }
            _ => 1,
        };
        streaks.touch(pair, count, now);
        streaks.enforce_bound(self.max_entries);
        drop(streaks);

        let action = if count >= self.hysteresis_count {
            EnforcementAction::Drop
        } else if self.rate_limit_pps == 0 {
            EnforcementAction::Allow
        } else {
            EnforcementAction::RateLimit {
                pps: self.rate_limit_pps,
            }
        };
        self.decision(result.flow_key, action)
    }

    /// 분류 실패 시 fail policy에 따른 결정
    pub fn fail_decision(&self, flow_key: FlowKey) -> EnforcementDecision {
        self.decision(flow_key, self.fail_policy.action())
    }

    /// 적용 중인 fail policy
    pub fn fail_policy(&self) -> FailPolicy {
        self.fail_policy
    }

    /// 엔드포인트 쌍의 현재 streak
    pub fn streak(&self, pair: &EndpointPair) -> u32 {
        self.streaks.lock().entries.get(pair).map_or(0, |s| s.count)
    }

    /// 추적 중인 엔드포인트 쌍 수
    pub fn tracked(&self) -> usize {
        self.streaks.lock().entries.len()
    }

    fn decision(&self, flow_key: FlowKey, action: EnforcementAction) -> EnforcementDecision {
        EnforcementDecision::new(flow_key, action, self.decision_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use flowsentry_core::types::Endpoint;

    use super::*;

    fn key(src: &str, port: u16) -> FlowKey {
        FlowKey::new(
            6,
            Endpoint::new(src.parse().unwrap(), port),
            Endpoint::new("10.10.0.5".parse().unwrap(), 80),
        )
    }

    fn result(key: FlowKey, malicious: bool, confidence: f64) -> ClassificationResult {
        ClassificationResult {
            flow_key: key,
            label: if malicious { "Syn" } else { "BENIGN" }.to_owned(),
            confidence,
            is_malicious: malicious,
        }
    }

    fn policy(count: u32) -> DecisionPolicy {
        DecisionPolicy::new(&ClassifierPipelineConfig {
            hysteresis_count: count,
            hysteresis_ttl: Duration::from_secs(60),
            rate_limit_pps: 500,
            ..ClassifierPipelineConfig::default()
        })
    }

    #[test]
    fn benign_is_allowed() {
        let d = policy(3).decide(&result(key("1.1.1.1", 1), false, 0.99));
        assert_eq!(d.action, EnforcementAction::Allow);
        assert_eq!(d.ttl_secs, 600);
    }

    #[test]
    fn low_confidence_malicious_is_allowed() {
        let d = policy(1).decide(&result(key("1.1.1.1", 1), true, 0.5));
        assert_eq!(d.action, EnforcementAction::Allow);
    }

    #[test]
    fn streak_escalates_to_drop_across_ports() {
        // Given: 같은 엔드포인트 쌍, 서로 다른 소스 포트
        let policy = policy(3);
        let now = Instant::now();

        // When / Then
        let a = policy.decide_at(&result(key("1.1.1.1", 1), true, 0.9), now);
        assert_eq!(a.action, EnforcementAction::RateLimit { pps: 500 });
        let b = policy.decide_at(&result(key("1.1.1.1", 2), true, 0.9), now);
        assert_eq!(b.action, EnforcementAction::RateLimit { pps: 500 });
        let c = policy.decide_at(&result(key("1.1.1.1", 3), true, 0.9), now);
        assert_eq!(c.action, EnforcementAction::Drop);
    }

    #[test]
    fn benign_resets_streak() {
        let policy = policy(2);
        let k = key("1.1.1.1", 1);
        policy.decide(&result(k, true, 0.9));
        assert_eq!(policy.streak(&k.endpoint_pair()), 1);

        policy.decide(&result(k, false, 0.9));
        assert_eq!(policy.streak(&k.endpoint_pair()), 0);
        assert_eq!(
            policy.decide(&result(k, true, 0.9)).action,
            EnforcementAction::RateLimit { pps: 500 }
        );
    }

    #[test]
    fn expired_streak_restarts() {
        let policy = policy(2);
        let k = key("1.1.1.1", 1);
        let start = Instant::now();
        policy.decide_at(&result(k, true, 0.9), start);

        let later = start + Duration::from_secs(61);
        let d = policy.decide_at(&result(k, true, 0.9), later);
        assert_eq!(d.action, EnforcementAction::RateLimit { pps: 500 });
        assert_eq!(policy.streak(&k.endpoint_pair()), 1);
    }

    #[test]
    fn zero_pps_downgrades_to_allow() {
        let policy = DecisionPolicy::new(&ClassifierPipelineConfig {
            rate_limit_pps: 0,
            ..ClassifierPipelineConfig::default()
        });
        let d = policy.decide(&result(key("1.1.1.1", 1), true, 0.95));
        assert_eq!(d.action, EnforcementAction::Allow);
    }

    #[test]
    fn hysteresis_one_drops_immediately() {
        let d = policy(1).decide(&result(key("1.1.1.1", 1), true, 0.9));
        assert_eq!(d.action, EnforcementAction::Drop);
    }

    #[test]
    fn map_is_bounded_and_evicts_oldest() {
        let policy = DecisionPolicy::new(&ClassifierPipelineConfig {
            hysteresis_max_entries: 3,
            ..ClassifierPipelineConfig::default()
        });
        let now = Instant::now();
        let keys: Vec<_> = (1..=5).map(|i| key(&format!("1.1.1.{i}"), 1)).collect();
        for k in &keys {
            policy.decide_at(&result(*k, true, 0.9), now);
        }

        assert_eq!(policy.tracked(), 3);
        assert_eq!(policy.streak(&keys[0].endpoint_pair()), 0);
        assert_eq!(policy.streak(&keys[1].endpoint_pair()), 0);
        assert_eq!(policy.streak(&keys[4].endpoint_pair()), 1);
    }

    #[test]
    fn refreshed_entry_survives_eviction() {
        let policy = DecisionPolicy::new(&ClassifierPipelineConfig {
            hysteresis_max_entries: 2,
            ..ClassifierPipelineConfig::default()
        });
        let now = Instant::now();
        let a = key("1.1.1.1", 1);
        let b = key("1.1.1.2", 1);
        let c = key("1.1.1.3", 1);
        policy.decide_at(&result(a, true, 0.9), now);
        policy.decide_at(&result(b, true, 0.9), now);
        policy.decide_at(&result(a, true, 0.9), now);
        policy.decide_at(&result(c, true, 0.9), now);

        assert_eq!(policy.streak(&a.endpoint_pair()), 2);
        assert_eq!(policy.streak(&b.endpoint_pair()), 0);
    }

    #[test]
    fn fail_decision_follows_policy() {
        let policy = DecisionPolicy::new(&ClassifierPipelineConfig {
            fail_policy: FailPolicy::Drop,
            ..ClassifierPipelineConfig::default()
        });
        assert_eq!(
            policy.fail_decision(key("1.1.1.1", 1)).action,
            EnforcementAction::Drop
        );
    }
}
