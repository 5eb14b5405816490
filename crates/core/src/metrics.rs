//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 각 모듈은 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()`,
//! `metrics::histogram!()` 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `flowsentry_`
//! - 모듈명: `flow_`, `classifier_`, `enforcement_`, `daemon_`
//! - 접미어: `_total` (counter), `_seconds` (histogram/latency), 없음 (gauge)
//!
//! # 사용 예시
//!
//! ```ignore
//! use flowsentry_core::metrics as m;
//!
//! metrics::counter!(m::FLOW_FINALIZED_TOTAL, m::LABEL_REASON => "fin").increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 확정 사유 레이블 키 (fin, rst, idle_timeout, active_timeout, shutdown)
pub const LABEL_REASON: &str = "reason";

/// 집행 액션 레이블 키 (allow, drop, rate_limit)
pub const LABEL_ACTION: &str = "action";

/// 실패 종류 레이블 키 (error, timeout, saturated)
pub const LABEL_KIND: &str = "kind";

/// 분류 라벨 레이블 키
pub const LABEL_LABEL: &str = "label";

// ─── Flow Engine 메트릭 ────────────────────────────────────────────

/// Flow: 처리된 전체 패킷 수 (counter)
pub const FLOW_PACKETS_TOTAL: &str = "flowsentry_flow_packets_total";

/// Flow: 플로우 대상이 아닌 패킷 수 (counter)
pub const FLOW_NON_FLOW_PACKETS_TOTAL: &str = "flowsentry_flow_non_flow_packets_total";

/// Flow: 생성된 플로우 수 (counter)
pub const FLOW_CREATED_TOTAL: &str = "flowsentry_flow_created_total";

/// Flow: 확정된 플로우 수 (counter, label: reason)
pub const FLOW_FINALIZED_TOTAL: &str = "flowsentry_flow_finalized_total";

/// Flow: 타임아웃으로 축출된 플로우 수 (counter)
pub const FLOW_EVICTED_TOTAL: &str = "flowsentry_flow_evicted_total";

/// Flow: 테이블 포화로 거부된 신규 플로우 수 (counter)
pub const FLOW_TABLE_FULL_TOTAL: &str = "flowsentry_flow_table_full_total";

/// Flow: 불변식 위반 수 (counter)
pub const FLOW_INVARIANT_VIOLATIONS_TOTAL: &str = "flowsentry_flow_invariant_violations_total";

/// Flow: 현재 활성 플로우 수 (gauge)
pub const FLOW_LIVE: &str = "flowsentry_flow_live";

/// Flow: 캡처 동작 여부 (gauge, 1 = up)
pub const FLOW_CAPTURE_UP: &str = "flowsentry_flow_capture_up";

// ─── Classifier 메트릭 ──────────────────────────────────────────────

/// Classifier: 분류 완료 수 (counter, label: label)
pub const CLASSIFIER_CLASSIFICATIONS_TOTAL: &str = "flowsentry_classifier_classifications_total";

/// Classifier: 큐 포화로 버려진 플로우 수 (counter)
pub const CLASSIFIER_OVERRUNS_TOTAL: &str = "flowsentry_classifier_overruns_total";

/// Classifier: 분류 실패 수 (counter, label: kind)
pub const CLASSIFIER_FAILURES_TOTAL: &str = "flowsentry_classifier_failures_total";

/// Classifier: 분류 큐 깊이 (gauge)
pub const CLASSIFIER_QUEUE_DEPTH: &str = "flowsentry_classifier_queue_depth";

/// Classifier: 분류 지연 시간 (histogram, 초)
pub const CLASSIFIER_LATENCY_SECONDS: &str = "flowsentry_classifier_latency_seconds";

// ─── Enforcement 메트릭 ─────────────────────────────────────────────

/// Enforcement: 생성된 결정 수 (counter, label: action)
pub const ENFORCEMENT_DECISIONS_TOTAL: &str = "flowsentry_enforcement_decisions_total";

/// Enforcement: 전달 성공 수 (counter)
pub const ENFORCEMENT_DELIVERIES_TOTAL: &str = "flowsentry_enforcement_deliveries_total";

/// Enforcement: 재시도 수 (counter)
pub const ENFORCEMENT_RETRIES_TOTAL: &str = "flowsentry_enforcement_retries_total";

/// Enforcement: 최종 전달 실패 수 (counter)
pub const ENFORCEMENT_FAILURES_TOTAL: &str = "flowsentry_enforcement_failures_total";

// ─── Daemon 메트릭 ──────────────────────────────────────────────────

/// Daemon: 가동 시간 (gauge, 초)
pub const DAEMON_UPTIME_SECONDS: &str = "flowsentry_daemon_uptime_seconds";

/// Daemon: 등록된 모듈 수 (gauge)
pub const DAEMON_MODULES_REGISTERED: &str = "flowsentry_daemon_modules_registered";

/// Daemon: 빌드 정보 (gauge, 항상 1)
pub const DAEMON_BUILD_INFO: &str = "flowsentry_daemon_build_info";

// ─── 히스토그램 버킷 ────────────────────────────────────────────────

/// 분류 지연 시간 버킷 (초): 100us ~ 1s
pub const CLASSIFICATION_LATENCY_BUCKETS: [f64; 10] = [
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0,
];

/// 모든 메트릭의 설명을 등록합니다.
///
/// `metrics::describe_counter!()`, `describe_gauge!()`, `describe_histogram!()`을
/// 호출하여 Prometheus 출력에 HELP 텍스트가 포함되도록 합니다.
/// 레코더 설치 직후 한 번 호출해야 합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    // Flow Engine
    describe_counter!(FLOW_PACKETS_TOTAL, "Total packet descriptors ingested");
    describe_counter!(
        FLOW_NON_FLOW_PACKETS_TOTAL,
        "Packets counted but not tracked (non TCP/UDP)"
    );
    describe_counter!(FLOW_CREATED_TOTAL, "Flow records created");
    describe_counter!(
        FLOW_FINALIZED_TOTAL,
        "Flows finalized, by reason (fin, rst, idle_timeout, active_timeout, shutdown)"
    );
    describe_counter!(FLOW_EVICTED_TOTAL, "Flows evicted by idle or active timeout");
    describe_counter!(
        FLOW_TABLE_FULL_TOTAL,
        "New flows rejected because the flow table was full"
    );
    describe_counter!(
        FLOW_INVARIANT_VIOLATIONS_TOTAL,
        "Lifecycle invariant violations observed in release builds"
    );
    describe_gauge!(FLOW_LIVE, "Number of live flows in the flow table");
    describe_gauge!(FLOW_CAPTURE_UP, "Whether the packet capture is attached (1) or down (0)");

    // Classifier
    describe_counter!(
        CLASSIFIER_CLASSIFICATIONS_TOTAL,
        "Completed classifications, by label"
    );
    describe_counter!(
        CLASSIFIER_OVERRUNS_TOTAL,
        "Finalized flows dropped because the classification queue was full"
    );
    describe_counter!(
        CLASSIFIER_FAILURES_TOTAL,
        "Classification failures, by kind (error, timeout, saturated)"
    );
    describe_gauge!(CLASSIFIER_QUEUE_DEPTH, "Current classification queue depth");
    describe_histogram!(
        CLASSIFIER_LATENCY_SECONDS,
        "Classifier prediction latency in seconds"
    );

    // Enforcement
    describe_counter!(
        ENFORCEMENT_DECISIONS_TOTAL,
        "Enforcement decisions produced, by action"
    );
    describe_counter!(
        ENFORCEMENT_DELIVERIES_TOTAL,
        "Enforcement decisions delivered to the sink"
    );
    describe_counter!(ENFORCEMENT_RETRIES_TOTAL, "Enforcement delivery retries");
    describe_counter!(
        ENFORCEMENT_FAILURES_TOTAL,
        "Enforcement decisions that could not be delivered"
    );

    // Daemon
    describe_gauge!(DAEMON_UPTIME_SECONDS, "flowsentry daemon uptime in seconds");
    describe_gauge!(DAEMON_MODULES_REGISTERED, "Number of registered modules");
    describe_gauge!(
        DAEMON_BUILD_INFO,
        "Build information (version, commit) as labels; value is always 1"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_METRIC_NAMES: &[&str] = &[
        FLOW_PACKETS_TOTAL,
        FLOW_NON_FLOW_PACKETS_TOTAL,
        FLOW_CREATED_TOTAL,
        FLOW_FINALIZED_TOTAL,
        FLOW_EVICTED_TOTAL,
        FLOW_TABLE_FULL_TOTAL,
        FLOW_INVARIANT_VIOLATIONS_TOTAL,
        FLOW_LIVE,
        FLOW_CAPTURE_UP,
        CLASSIFIER_CLASSIFICATIONS_TOTAL,
        CLASSIFIER_OVERRUNS_TOTAL,
        CLASSIFIER_FAILURES_TOTAL,
        CLASSIFIER_QUEUE_DEPTH,
        CLASSIFIER_LATENCY_SECONDS,
        ENFORCEMENT_DECISIONS_TOTAL,
        ENFORCEMENT_DELIVERIES_TOTAL,
        ENFORCEMENT_RETRIES_TOTAL,
        ENFORCEMENT_FAILURES_TOTAL,
        DAEMON_UPTIME_SECONDS,
        DAEMON_MODULES_REGISTERED,
        DAEMON_BUILD_INFO,
    ];

    #[test]
    fn all_metrics_start_with_flowsentry_prefix() {
        for name in ALL_METRIC_NAMES {
            assert!(
                name.starts_with("flowsentry_"),
                "Metric '{}' does not start with 'flowsentry_' prefix",
                name
            );
        }
    }

    #[test]
    fn metric_names_are_unique() {
        let mut names = ALL_METRIC_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ALL_METRIC_NAMES.len());
    }

    #[test]
    fn counters_end_with_total() {
        let counters = [
            FLOW_PACKETS_TOTAL,
            FLOW_FINALIZED_TOTAL,
            CLASSIFIER_OVERRUNS_TOTAL,
            ENFORCEMENT_RETRIES_TOTAL,
        ];
        for name in counters {
            assert!(name.ends_with("_total"), "counter '{name}' must end with _total");
        }
    }

    #[test]
    fn describe_all_does_not_panic() {
        // 레코더 미설치 상태에서도 패닉하지 않아야 함
        describe_all();
    }

    #[test]
    fn label_keys_are_lowercase() {
        for label in [LABEL_REASON, LABEL_ACTION, LABEL_KIND, LABEL_LABEL] {
            assert_eq!(
                label.to_lowercase(),
                label,
                "Label key '{}' should be lowercase",
                label
            );
        }
    }

    #[test]
    fn latency_buckets_are_sorted() {
        let buckets = CLASSIFICATION_LATENCY_BUCKETS;
        for i in 1..buckets.len() {
            assert!(
                buckets[i] > buckets[i - 1],
                "Bucket values must be in ascending order"
            );
        }
    }
}
