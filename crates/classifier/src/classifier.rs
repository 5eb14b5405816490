//! 분류기 구현
//!
//! [`FlowClassifier`] trait의 두 가지 구현을 제공합니다.
//!
//! - [`ThresholdClassifier`]: 패킷 속도, SYN 비율, 양방향 비대칭 규칙
//! - [`LinearModelClassifier`]: JSON 모델 파일에서 읽은 로지스틱 선형 모델
//!
//! 파이프라인은 [`build_classifier`]가 반환하는 trait 객체에만 의존합니다.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use flowsentry_core::error::FlowSentryError;
use flowsentry_core::pipeline::FlowClassifier;
use flowsentry_core::types::{
    FEATURE_COUNT, FEATURE_SCHEMA_VERSION, FeatureVector, Prediction, feature_index,
};

use crate::config::{ClassifierKind, ClassifierPipelineConfig};
use crate::error::ClassifierError;

/// 모델 파일 최대 크기 (4 MB)
const MAX_MODEL_FILE_SIZE: u64 = 4 * 1024 * 1024;

/// 지원하는 모델 형식 버전 범위
const SUPPORTED_FORMAT: &str = "^1";

// =============================================================================
// 임계값 분류기
// =============================================================================

/// 임계값 규칙
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRules {
    /// 초당 패킷 수 상한
    pub max_packets_per_sec: f64,
    /// SYN 플래그 패킷 비율 상한
    pub max_syn_ratio: f64,
    /// 규칙을 적용할 최소 패킷 수
    pub min_packets: f64,
    /// 역방향/정방향 패킷 비율 하한 (이보다 작으면 단방향 공격으로 봄)
    pub min_down_up_ratio: f64,
}

impl Default for ThresholdRules {
    fn default() -> Self {
        Self {
            max_packets_per_sec: 5000.0,
            max_syn_ratio: 0.8,
            min_packets: 10.0,
            min_down_up_ratio: 0.1,
        }
    }
}

/// 특징 인덱스 캐시
#[derive(Debug, Clone, Copy)]
struct RuleIndices {
    fwd_packets: usize,
    bwd_packets: usize,
    packets_per_sec: usize,
    syn_count: usize,
    down_up: usize,
}

impl RuleIndices {
    fn resolve() -> Result<Self, ClassifierError> {
        let index = |name: &str| {
            feature_index(name).ok_or_else(|| ClassifierError::Prediction(format!(
                "feature '{name}' missing from {FEATURE_SCHEMA_VERSION}"
            )))
        };
        Ok(Self {
            fwd_packets: index("Total Fwd Packets")?,
            bwd_packets: index("Total Backward Packets")?,
            packets_per_sec: index("Flow Packets/s")?,
            syn_count: index("SYN Flag Count")?,
            down_up: index("Down/Up Ratio")?,
        })
    }
}

/// 규칙 기반 분류기
///
/// 규칙별로 신뢰도를 계산해 가장 높은 규칙의 레이블을 사용합니다.
/// 어느 규칙에도 걸리지 않으면 `BENIGN`(0.9)입니다.
#[derive(Debug, Clone)]
pub struct ThresholdClassifier {
    rules: ThresholdRules,
    indices: RuleIndices,
}

impl ThresholdClassifier {
    /// 규칙으로 분류기를 생성합니다.
    ///
    /// # 에러
    /// - `ClassifierError::Config`: 규칙 값이 양수가 아닌 경우
    pub fn new(rules: ThresholdRules) -> Result<Self, ClassifierError> {
        let positive = [
            ("max_packets_per_sec", rules.max_packets_per_sec),
            ("max_syn_ratio", rules.max_syn_ratio),
            ("min_down_up_ratio", rules.min_down_up_ratio),
        ];
        for (field, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ClassifierError::Config {
                    field: field.to_owned(),
                    reason: "must be a positive number".to_owned(),
                });
            }
        }
        Ok(Self {
            rules,
            indices: RuleIndices::resolve()?,
        })
    }

    /// 적용 중인 규칙
    pub fn rules(&self) -> &ThresholdRules {
        &self.rules
    }

    fn evaluate(&self, features: &FeatureVector) -> Prediction {
        let at = |i: usize| features.value(i).unwrap_or(0.0);
        let fwd = at(self.indices.fwd_packets);
        let bwd = at(self.indices.bwd_packets);
        let total = fwd + bwd;
        if total < self.rules.min_packets {
            return Prediction::benign(0.9);
        }

        let mut best: Option<(&str, f64)> = None;
        let mut consider = |label: &'static str, confidence: f64| {
            if best.is_none_or(|(_, c)| confidence > c) {
                best = Some((label, confidence));
            }
        };

        let pps = at(self.indices.packets_per_sec);
        if pps > self.rules.max_packets_per_sec {
            consider("Flood", 0.5 + 0.5 * (1.0 - self.rules.max_packets_per_sec / pps));
        }

        let syn_ratio = at(self.indices.syn_count) / total;
        if syn_ratio > self.rules.max_syn_ratio {
            consider("Syn", syn_ratio);
        }

        let down_up = at(self.indices.down_up);
        if bwd == 0.0 || down_up < self.rules.min_down_up_ratio {
            consider(
                "Asymmetric",
                0.5 + 0.5 * (1.0 - down_up / self.rules.min_down_up_ratio),
            );
        }

        match best {
            Some((label, confidence)) => Prediction::malicious(label, confidence),
            None => Prediction::benign(0.9),
        }
    }
}

impl FlowClassifier for ThresholdClassifier {
    fn name(&self) -> &str {
        "threshold"
    }

    fn predict(&self, features: &FeatureVector) -> Result<Prediction, FlowSentryError> {
        Ok(self.evaluate(features))
    }
}

// =============================================================================
// 선형 모델 분류기
// =============================================================================

/// JSON 모델 파일 형식
///
/// ```text
/// {
///   "format_version": "1.0.0",
///   "schema": "cic-ddos2019-v1",
///   "label": "DrDoS",
///   "bias": -2.5,
///   "weights": [80 floats],
///   "means": [80 floats, optional],
///   "scales": [80 floats, optional]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    /// 모델 형식 버전 (semver)
    pub format_version: String,
    /// 특징 스키마 버전
    pub schema: String,
    /// 악성 판정 시 레이블
    pub label: String,
    /// 절편
    pub bias: f64,
    /// 특징별 가중치
    pub weights: Vec<f64>,
    /// 표준화 평균 (비어 있으면 생략)
    #[serde(default)]
    pub means: Vec<f64>,
    /// 표준화 스케일 (비어 있으면 생략)
    #[serde(default)]
    pub scales: Vec<f64>,
}

impl LinearModel {
    /// 형식/스키마/차원을 검증합니다.
    pub fn validate(&self) -> Result<(), ClassifierError> {
        let requirement = semver::VersionReq::parse(SUPPORTED_FORMAT).map_err(|e| {
            ClassifierError::Prediction(format!("invalid format requirement: {e}"))
        })?;
        let version = semver::Version::parse(&self.format_version).map_err(|_| {
            ClassifierError::UnsupportedFormat {
                version: self.format_version.clone(),
                requirement: SUPPORTED_FORMAT.to_owned(),
            }
        })?;
        if !requirement.matches(&version) {
            return Err(ClassifierError::UnsupportedFormat {
                version: self.format_version.clone(),
                requirement: SUPPORTED_FORMAT.to_owned(),
            });
        }

        if self.schema != FEATURE_SCHEMA_VERSION {
            return Err(ClassifierError::SchemaMismatch {
                expected: FEATURE_SCHEMA_VERSION.to_owned(),
                found: self.schema.clone(),
            });
        }

        let dimension = |name: &str, values: &[f64], optional: bool| {
            if (optional && values.is_empty()) || values.len() == FEATURE_COUNT {
                Ok(())
            } else {
                Err(ClassifierError::Prediction(format!(
                    "{name} has {} values, expected {FEATURE_COUNT}",
                    values.len()
                )))
            }
        };
        dimension("weights", &self.weights, false)?;
        dimension("means", &self.means, true)?;
        dimension("scales", &self.scales, true)?;

        let all_finite = std::iter::once(self.bias)
            .chain(self.weights.iter().copied())
            .chain(self.means.iter().copied())
            .chain(self.scales.iter().copied())
            .all(f64::is_finite);
        if !all_finite {
            return Err(ClassifierError::Prediction(
                "model contains non-finite parameters".to_owned(),
            ));
        }
        Ok(())
    }

    fn score(&self, values: &[f64]) -> f64 {
        let logit = values
            .iter()
            .zip(&self.weights)
            .enumerate()
            .map(|(i, (x, w))| {
                let mean = self.means.get(i).copied().unwrap_or(0.0);
                let scale = self.scales.get(i).copied().unwrap_or(1.0);
                let scaled = if scale == 0.0 { 0.0 } else { (x - mean) / scale };
                w * scaled
            })
            .sum::<f64>()
            + self.bias;
        1.0 / (1.0 + (-logit).exp())
    }
}

/// 로지스틱 선형 분류기
#[derive(Debug, Clone)]
pub struct LinearModelClassifier {
    model: LinearModel,
}

impl LinearModelClassifier {
    /// 검증된 모델로 분류기를 생성합니다.
    pub fn new(model: LinearModel) -> Result<Self, ClassifierError> {
        model.validate()?;
        Ok(Self { model })
    }

    /// JSON 모델 파일을 읽습니다.
    ///
    /// # 에러
    /// - `ClassifierError::ModelLoad`: 파일이 없거나, 너무 크거나, JSON이 아닌 경우
    /// - `ClassifierError::SchemaMismatch`: 스키마 버전 불일치
    /// - `ClassifierError::UnsupportedFormat`: 형식 버전 불일치
    pub fn from_file(path: &Path) -> Result<Self, ClassifierError> {
        let load_error = |reason: String| ClassifierError::ModelLoad {
            path: path.display().to_string(),
            reason,
        };

        let metadata = std::fs::metadata(path)
            .map_err(|e| load_error(format!("failed to read metadata: {e}")))?;
        if metadata.len() > MAX_MODEL_FILE_SIZE {
            return Err(load_error(format!(
                "file too large: {} bytes (max: {MAX_MODEL_FILE_SIZE})",
                metadata.len()
            )));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| load_error(format!("failed to read file: {e}")))?;
        let model: LinearModel = serde_json::from_str(&content)
            .map_err(|e| load_error(format!("failed to parse JSON: {e}")))?;

        let classifier = Self::new(model)?;
        info!(
            path = %path.display(),
            label = %classifier.model.label,
            format_version = %classifier.model.format_version,
            "linear model loaded"
        );
        Ok(classifier)
    }

    /// 로드된 모델
    pub fn model(&self) -> &LinearModel {
        &self.model
    }
}

impl FlowClassifier for LinearModelClassifier {
    fn name(&self) -> &str {
        "linear"
    }

    fn predict(&self, features: &FeatureVector) -> Result<Prediction, FlowSentryError> {
        if features.schema() != self.model.schema {
            return Err(ClassifierError::SchemaMismatch {
                expected: self.model.schema.clone(),
                found: features.schema().to_owned(),
            }
            .into());
        }

        let p = self.model.score(features.as_slice());
        if !p.is_finite() {
            return Err(ClassifierError::Prediction("non-finite score".to_owned()).into());
        }
        Ok(if p >= 0.5 {
            Prediction::malicious(self.model.label.clone(), p)
        } else {
            Prediction::benign(1.0 - p)
        })
    }
}

/// 설정에 맞는 분류기를 생성합니다.
///
/// # 에러
/// - 모델 로딩/검증 에러
pub fn build_classifier(
    config: &ClassifierPipelineConfig,
) -> Result<Arc<dyn FlowClassifier>, ClassifierError> {
    match config.kind {
        ClassifierKind::Threshold => Ok(Arc::new(ThresholdClassifier::new(
            ThresholdRules::default(),
        )?)),
        ClassifierKind::Linear => {
            let path = config.model_path.as_deref().ok_or_else(|| ClassifierError::Config {
                field: "model_path".to_owned(),
                reason: "required for the linear classifier".to_owned(),
            })?;
            Ok(Arc::new(LinearModelClassifier::from_file(path)?))
        }
    }
}
